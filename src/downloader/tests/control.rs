use super::*;

#[tokio::test]
async fn test_unknown_item_is_not_an_error() {
    let (manager, _transport, _temp_dir) = create_test_manager(1).await;

    assert!(!manager.pause(ItemId(404)).unwrap());
    assert!(!manager.resume(ItemId(404)).unwrap());
    assert!(!manager.cancel(ItemId(404)).unwrap());
}

#[tokio::test]
async fn test_cancel_running_item() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    let gate = Gate::new();
    transport.script(&url("a"), Script::new(BODY).held(&gate));
    let mut events = manager.subscribe();

    manager.queue(QueueRequest::new(1, url("a"))).unwrap();
    let task = manager.task(ItemId(1)).unwrap();
    eventually("first chunk written", || task.snapshot().bytes_received == 4).await;

    assert!(manager.cancel(ItemId(1)).unwrap());

    let (state, error) = wait_for_stop(&mut events, ItemId(1)).await;
    assert_eq!(state, TaskState::Cancelled);
    assert_eq!(error, None);
    assert!(!manager.contains(ItemId(1)));
    assert_eq!(manager.status(ItemId(1)), None);
    assert!(!task.path().exists());
}

#[tokio::test]
async fn test_pause_then_resume_completes() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    let gate = Gate::new();
    transport.script(&url("a"), Script::new(BODY).held(&gate));
    let mut events = manager.subscribe();

    manager.queue(QueueRequest::new(2, url("a"))).unwrap();
    let task = manager.task(ItemId(2)).unwrap();
    eventually("first chunk written", || task.snapshot().bytes_received == 4).await;

    assert!(manager.pause(ItemId(2)).unwrap());
    eventually("paused", || manager.status(ItemId(2)) == Some(TaskState::Paused)).await;
    assert!(manager.contains(ItemId(2)));

    assert!(manager.resume(ItemId(2)).unwrap());
    gate.release();

    let (state, _) = wait_for_stop(&mut events, ItemId(2)).await;
    assert_eq!(state, TaskState::Completed);
    assert_eq!(std::fs::read(task.path()).unwrap(), BODY);

    let offsets: Vec<u64> = transport.opens().into_iter().map(|(_, offset)| offset).collect();
    assert_eq!(offsets, vec![0, 4]);
}

#[tokio::test]
async fn test_cancel_after_completion_returns_false() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    manager.queue(QueueRequest::new(3, url("a"))).unwrap();
    let (state, _) = wait_for_stop(&mut events, ItemId(3)).await;
    assert_eq!(state, TaskState::Completed);

    assert!(!manager.cancel(ItemId(3)).unwrap());
    assert!(!manager.pause(ItemId(3)).unwrap());
}

#[tokio::test]
async fn test_failed_item_can_be_retried() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    transport.script(&url("a"), Script::status(404));
    let mut events = manager.subscribe();

    manager.queue(QueueRequest::new(8, url("a"))).unwrap();
    let (state, error) = wait_for_stop(&mut events, ItemId(8)).await;
    assert_eq!(state, TaskState::Failed);
    assert!(error.unwrap().contains("404"));
    assert!(!manager.contains(ItemId(8)));

    transport.script(&url("a"), Script::new(BODY));
    assert!(manager.queue(QueueRequest::new(8, url("a"))).unwrap());
    let (state, error) = wait_for_stop(&mut events, ItemId(8)).await;
    assert_eq!(state, TaskState::Completed);
    assert_eq!(error, None);
}

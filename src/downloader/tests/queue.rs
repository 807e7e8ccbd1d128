use super::*;

#[tokio::test]
async fn test_queue_adds_download() {
    let (manager, transport, _temp_dir) = create_test_manager(2).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    assert!(manager.queue(QueueRequest::new(1, url("a"))).unwrap());

    match events.recv().await.unwrap() {
        Event::Queued { id, name } => {
            assert_eq!(id, ItemId(1));
            assert_eq!(name, "a.mp3");
        }
        other => panic!("expected Queued first, got {:?}", other),
    }

    let (state, error) = wait_for_stop(&mut events, ItemId(1)).await;
    assert_eq!(state, TaskState::Completed);
    assert_eq!(error, None);
}

#[tokio::test]
async fn test_queue_is_idempotent_while_live() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    let gate = Gate::new();
    transport.script(&url("a"), Script::new(BODY).held(&gate));

    assert!(manager.queue(QueueRequest::new(7, url("a"))).unwrap());
    let first = manager.task(ItemId(7)).unwrap();

    // Same id, even with a different URL, is skipped
    assert!(!manager.queue(QueueRequest::new(7, url("b"))).unwrap());
    assert_eq!(manager.task(ItemId(7)).unwrap().id(), first.id());
    assert_eq!(manager.group().tasks().len(), 1);

    gate.release();
    manager.wait_idle().await;
}

#[tokio::test]
async fn test_requeue_after_stop_creates_fresh_task() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    manager.queue(QueueRequest::new(1, url("a"))).unwrap();
    let first = manager.task(ItemId(1)).map(|t| t.id());
    wait_for_stop(&mut events, ItemId(1)).await;
    assert!(!manager.contains(ItemId(1)));
    assert_eq!(manager.status(ItemId(1)), None);

    assert!(manager.queue(QueueRequest::new(1, url("a"))).unwrap());
    let second = manager.task(ItemId(1)).map(|t| t.id());
    assert_ne!(first, second);
    wait_for_stop(&mut events, ItemId(1)).await;
}

#[tokio::test]
async fn test_invalid_url_rejects_whole_batch() {
    let (manager, transport, _temp_dir) = create_test_manager(2).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    let result = manager.queue_many([
        QueueRequest::new(1, url("a")),
        QueueRequest::new(2, "not a url"),
    ]);

    assert!(matches!(result, Err(Error::InvalidUrl { .. })));
    assert!(!manager.contains(ItemId(1)));
    assert!(!manager.contains(ItemId(2)));
    assert!(manager.group().tasks().is_empty());
    assert!(drain(&mut events).is_empty(), "nothing may be announced");
}

#[tokio::test]
async fn test_batch_preserves_order_and_skips_repeats() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    let gate = Gate::new();
    for name in ["a", "b", "c"] {
        transport.script(&url(name), Script::new(BODY).held(&gate));
    }

    let queued = manager
        .queue_many([
            QueueRequest::new(3, url("a")),
            QueueRequest::new(1, url("b")),
            QueueRequest::new(3, url("b")),
            QueueRequest::new(2, url("c")),
        ])
        .unwrap();

    assert_eq!(queued, vec![ItemId(3), ItemId(1), ItemId(2)]);
    assert_eq!(manager.queued_ids(), vec![ItemId(3), ItemId(1), ItemId(2)]);
    assert_eq!(manager.status(ItemId(3)), Some(TaskState::Running));
    assert_eq!(manager.status(ItemId(1)), Some(TaskState::Queued));

    gate.release();
    manager.wait_idle().await;
    assert!(manager.queued_ids().is_empty());
}

#[tokio::test]
async fn test_display_name_and_destination() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    let gate = Gate::new();
    transport.script(&url("a"), Script::new(BODY).held(&gate));
    let mut events = manager.subscribe();

    manager
        .queue(QueueRequest::new(5, url("a")).with_name("Pilot Episode"))
        .unwrap();

    let task = manager.task(ItemId(5)).unwrap();
    let expected = crate::paths::derive_destination(&manager.config().download.temp_dir, &url("a"))
        .unwrap();
    assert_eq!(task.path(), expected.path);
    assert_eq!(task.name(), "Pilot Episode");

    match events.recv().await.unwrap() {
        Event::Queued { name, .. } => assert_eq!(name, "Pilot Episode"),
        other => panic!("expected Queued, got {:?}", other),
    }

    gate.release();
    manager.wait_idle().await;
}

#[tokio::test]
async fn test_payload_is_returned_in_events() {
    #[derive(Debug, PartialEq)]
    struct Item {
        feed: &'static str,
    }

    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    manager
        .queue(QueueRequest::new(9, url("a")).with_payload(Payload::new(Item { feed: "daily" })))
        .unwrap();

    let stop = async {
        loop {
            if let Event::Stopped { payload, .. } = events.recv().await.unwrap() {
                return payload;
            }
        }
    };
    let payload = tokio::time::timeout(std::time::Duration::from_secs(5), stop)
        .await
        .unwrap();
    assert_eq!(payload.downcast_ref::<Item>(), Some(&Item { feed: "daily" }));
}

#[tokio::test]
async fn test_progress_events_carry_item_id() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    manager.queue(QueueRequest::new(4, url("a"))).unwrap();

    let mut progress = Vec::new();
    let stop = async {
        loop {
            match events.recv().await.unwrap() {
                Event::Progress { id, fraction, .. } => progress.push((id, fraction)),
                Event::Stopped { .. } => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), stop)
        .await
        .unwrap();

    assert!(!progress.is_empty());
    assert!(progress.iter().all(|(id, _)| *id == ItemId(4)));
    assert_eq!(progress.last().unwrap().1, Some(1.0));
}

#[tokio::test]
async fn test_requeue_before_stop_is_delivered_keeps_both_stops() {
    let (manager, transport, _temp_dir) = create_test_manager(1).await;
    transport.script(&url("a"), Script::new(BODY));
    let mut events = manager.subscribe();

    // Hold the event consumer on the first run's terminal transition
    let (held_tx, held_rx) = std::sync::mpsc::channel::<()>();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let hold = std::sync::Mutex::new(Some((held_tx, release_rx)));
    manager.group().add_listener(Arc::new(move |event: &TaskEvent| {
        if !matches!(event, TaskEvent::StateChanged { new: TaskState::Completed, .. }) {
            return;
        }
        let taken = hold.lock().unwrap().take();
        if let Some((held, release)) = taken {
            held.send(()).unwrap();
            release.recv().unwrap();
        }
    }));

    manager.queue(QueueRequest::new(7, url("a"))).unwrap();
    tokio::task::spawn_blocking(move || held_rx.recv_timeout(std::time::Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    // The first task is terminal but its Stopped is still queued
    assert!(manager.queue(QueueRequest::new(7, url("a"))).unwrap());
    release_tx.send(()).unwrap();

    let (first, _) = wait_for_stop(&mut events, ItemId(7)).await;
    let (second, _) = wait_for_stop(&mut events, ItemId(7)).await;
    assert_eq!(first, TaskState::Completed);
    assert_eq!(second, TaskState::Completed);
    assert!(!manager.contains(ItemId(7)));
}

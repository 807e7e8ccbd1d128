//! Single-consumer command executor.
//!
//! A [`CommandQueue`] runs submitted closures one at a time, strictly in submission order,
//! off the caller's thread. No worker exists while the queue is idle: the first submission
//! borrows a thread from tokio's blocking pool, which drains the backlog and then returns
//! to the pool. Submissions that arrive during a drain join that drain instead of starting
//! another consumer.
//!
//! A panic inside a command is caught and logged; the commands behind it still run.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{Error, Result};


/// A unit of work, executed exactly once
pub type Command = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked at drain-cycle boundaries
pub type QueueEventHandler = Arc<dyn Fn(QueueEvent) + Send + Sync>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the queue whose drain loop owns the current thread, if any
    static DRAINING_QUEUE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Drain-cycle boundary notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    /// The consumer is about to run the backlog
    ProcessingStarted,
    /// The backlog ran empty
    ProcessingCompleted,
}

/// Serializes arbitrary closures onto one logical consumer (cloneable - all state is shared)
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    runtime: Handle,
    state: Mutex<QueueState>,
    handlers: RwLock<Vec<QueueEventHandler>>,
    /// `true` while no drain loop is active
    idle_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Command>,
    executing: bool,
    shut_down: bool,
}

impl CommandQueue {
    /// Create a queue bound to the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`] when called outside a tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self::with_handle(runtime))
    }

    /// Create a queue that borrows workers from the given runtime
    pub fn with_handle(runtime: Handle) -> Self {
        let (idle_tx, _idle_rx) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                runtime,
                state: Mutex::new(QueueState::default()),
                handlers: RwLock::new(Vec::new()),
                idle_tx,
            }),
        }
    }

    /// Register a handler for [`QueueEvent`]s
    ///
    /// Handlers run on the consumer thread; a panicking handler is logged and skipped.
    pub fn on_event(&self, handler: impl Fn(QueueEvent) + Send + Sync + 'static) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Enqueue one command
    ///
    /// Returns `false` (and drops the command unrun) once the queue has been shut down.
    pub fn submit(&self, command: impl FnOnce() + Send + 'static) -> bool {
        self.submit_many(std::iter::once(Box::new(command) as Command))
    }

    /// Enqueue several commands; they run back to back in iteration order
    ///
    /// Returns `false` (and drops the commands unrun) once the queue has been shut down.
    pub fn submit_many(&self, commands: impl IntoIterator<Item = Command>) -> bool {
        let start_consumer = {
            let mut state = self.shared.lock_state();
            if state.shut_down {
                tracing::debug!(queue_id = self.shared.id, "Dropping submission after shutdown");
                return false;
            }

            let before = state.pending.len();
            state.pending.extend(commands);
            if state.pending.len() == before {
                return true;
            }

            if state.executing {
                false
            } else {
                state.executing = true;
                self.shared.idle_tx.send_replace(false);
                true
            }
        };

        if start_consumer {
            let shared = Arc::clone(&self.shared);
            self.shared.runtime.spawn_blocking(move || shared.drain());
        }

        true
    }

    /// Whether a drain loop is currently active
    pub fn is_executing(&self) -> bool {
        self.shared.lock_state().executing
    }

    /// Number of commands waiting to run
    pub fn pending(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_state().shut_down
    }

    /// Whether the calling thread is this queue's consumer (i.e. we are inside a command)
    pub fn is_consumer_thread(&self) -> bool {
        DRAINING_QUEUE.with(|current| current.get() == Some(self.shared.id))
    }

    /// Resolve once every command submitted so far has run
    pub async fn wait_idle(&self) {
        let mut idle_rx = self.shared.idle_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = idle_rx.wait_for(|idle| *idle).await;
    }

    /// Stop accepting commands and wait for the in-flight drain to finish
    ///
    /// Commands already queued still run.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutdownFromConsumer`] if called from a command running on this queue,
    ///   where waiting would deadlock
    /// - [`Error::AlreadyShutDown`] on a second call
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_consumer_thread() {
            tracing::error!(
                queue_id = self.shared.id,
                "Shutdown requested from the queue's own consumer"
            );
            return Err(Error::ShutdownFromConsumer);
        }

        {
            let mut state = self.shared.lock_state();
            if state.shut_down {
                return Err(Error::AlreadyShutDown);
            }
            state.shut_down = true;
        }

        self.wait_idle().await;
        tracing::debug!(queue_id = self.shared.id, "Command queue shut down");
        Ok(())
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("CommandQueue")
            .field("id", &self.shared.id)
            .field("pending", &state.pending.len())
            .field("executing", &state.executing)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Command> {
        self.lock_state().pending.pop_front()
    }

    /// Consumer loop; runs on a blocking-pool thread until the backlog is empty
    fn drain(&self) {
        DRAINING_QUEUE.with(|current| current.set(Some(self.id)));

        loop {
            self.raise(QueueEvent::ProcessingStarted);

            let mut executed = 0usize;
            while let Some(command) = self.pop() {
                executed += 1;
                if let Err(panic) = catch_unwind(AssertUnwindSafe(command)) {
                    tracing::error!(
                        queue_id = self.id,
                        panic = panic_message(&*panic),
                        "Command panicked; continuing with the next one"
                    );
                }
            }

            self.raise(QueueEvent::ProcessingCompleted);
            tracing::debug!(queue_id = self.id, executed, "Drain cycle finished");

            let mut state = self.lock_state();
            if state.pending.is_empty() {
                state.executing = false;
                self.idle_tx.send_replace(true);
                break;
            }
            // Work arrived between the last pop and the completion event; go around again.
        }

        DRAINING_QUEUE.with(|current| current.set(None));
    }

    fn raise(&self, event: QueueEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                tracing::error!(
                    queue_id = self.id,
                    ?event,
                    panic = panic_message(&*panic),
                    "Queue event handler panicked"
                );
            }
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

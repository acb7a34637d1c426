use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{QueueError, QueueName, Task, TaskHandler, TaskQueue};
use crate::worker::WorkerError;

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
    /// Per-queue overrides of `worker_slots`.
    #[serde(default)]
    pub slots: BTreeMap<QueueName, usize>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_worker_slots() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_slots: default_worker_slots(),
            slots: BTreeMap::new(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl QueueSettings {
    fn slots_for(&self, queue: QueueName) -> usize {
        self.slots
            .get(&queue)
            .copied()
            .unwrap_or(self.worker_slots)
            .max(1)
    }
}

#[derive(Debug)]
struct Envelope {
    task: Task,
    attempt: u32,
}

/// Named queues backed by tokio channels, each drained by a bounded pool of
/// worker slots.
pub struct LocalTaskQueue {
    settings: QueueSettings,
    senders: HashMap<QueueName, mpsc::UnboundedSender<Envelope>>,
    receivers: Mutex<HashMap<QueueName, mpsc::UnboundedReceiver<Envelope>>>,
    handlers: Mutex<HashMap<QueueName, Arc<dyn TaskHandler>>>,
}

impl LocalTaskQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(queue, tx);
            receivers.insert(queue, rx);
        }
        Self {
            settings,
            senders,
            receivers: Mutex::new(receivers),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, queue: QueueName, handler: Arc<dyn TaskHandler>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(queue, handler);
        }
    }

    /// Starts one dispatcher per registered queue. The returned set finishes
    /// once `shutdown` is cancelled and in-flight tasks have returned.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinSet<()> {
        let mut dispatchers = JoinSet::new();
        let handlers = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return dispatchers,
        };
        let mut receivers = match self.receivers.lock() {
            Ok(receivers) => receivers,
            Err(_) => return dispatchers,
        };
        for (queue, handler) in handlers {
            let Some(rx) = receivers.remove(&queue) else {
                log::warn!("Queue {queue} already started");
                continue;
            };
            log::info!(
                "Starting queue {queue} with {} worker slots",
                self.settings.slots_for(queue)
            );
            dispatchers.spawn(Arc::clone(self).dispatch(queue, rx, handler, shutdown.clone()));
        }
        dispatchers
    }

    async fn dispatch(
        self: Arc<Self>,
        queue: QueueName,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        handler: Arc<dyn TaskHandler>,
        shutdown: CancellationToken,
    ) {
        let slots = Arc::new(Semaphore::new(self.settings.slots_for(queue)));
        let mut running = JoinSet::new();
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let cancel = shutdown.child_token();
            running.spawn(async move {
                let _permit = permit;
                this.run_one(queue, envelope, handler, cancel).await;
            });
            while let Some(result) = running.try_join_next() {
                if let Err(e) = result {
                    log::error!("Task on queue {queue} did not finish: {e}");
                }
            }
        }
        log::info!("Queue {queue} stopping, waiting for {} tasks", running.len());
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                log::error!("Task on queue {queue} did not finish: {e}");
            }
        }
    }

    async fn run_one(
        &self,
        queue: QueueName,
        envelope: Envelope,
        handler: Arc<dyn TaskHandler>,
        cancel: CancellationToken,
    ) {
        let Envelope { task, attempt } = envelope;
        // A panicking handler is retried like a failing one.
        let result = AssertUnwindSafe(handler.handle(task.clone(), cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                log::error!("Task on queue {queue} panicked: {message}");
                Err(WorkerError::Panicked(message))
            });
        match result {
            Ok(()) => log::debug!("Task on queue {queue} acknowledged"),
            Err(e) if attempt + 1 < self.settings.max_attempts => {
                log::warn!("Task on queue {queue} failed (attempt {}): {e}", attempt + 1);
                self.requeue(queue, task, attempt + 1);
            }
            Err(e) => {
                log::error!(
                    "Task on queue {queue} failed {} times, dropping it: {e}",
                    attempt + 1
                );
            }
        }
    }

    fn requeue(&self, queue: QueueName, task: Task, attempt: u32) {
        let Some(sender) = self.senders.get(&queue).cloned() else {
            return;
        };
        let delay = Duration::from_secs(self.settings.retry_delay_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(Envelope { task, attempt }).is_err() {
                log::warn!("Queue {queue} closed before a retry could be delivered");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let queue = task.queue();
        let sender = self.senders.get(&queue).ok_or(QueueError::Closed(queue))?;
        sender
            .send(Envelope { task, attempt: 0 })
            .map_err(|_| QueueError::Closed(queue))
    }
}

//! Deployment log lines: a realtime topic per deployment and a batched
//! durable sink.

mod progress;

pub use progress::PushProgressTable;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::DeploymentLog;
use crate::pubsub::LogBroker;
use crate::store::EntityStore;

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_flush_interval() -> u64 {
    2000
}

fn default_buffer_size() -> usize {
    500
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Handle workers use to write deployment logs.
#[derive(Clone)]
pub struct DeploymentLogger {
    broker: Arc<LogBroker>,
    sink: mpsc::UnboundedSender<DeploymentLog>,
}

impl DeploymentLogger {
    /// Creates a logger and the sink that persists what it writes.
    pub fn new(
        broker: Arc<LogBroker>,
        store: Arc<dyn EntityStore>,
        settings: LogSettings,
    ) -> (Self, LogSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = LogSink {
            store,
            rx,
            buffer: Vec::with_capacity(settings.buffer_size),
            buffer_limit: settings.buffer_size.max(1),
            flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
        };
        (Self { broker, sink: tx }, sink)
    }

    /// Writes a line to the realtime topic and the durable sink.
    pub fn log(&self, deployment_id: &str, content: impl Into<String>) {
        let content = content.into();
        self.live(deployment_id, content.clone());
        let entry = DeploymentLog {
            deployment_id: deployment_id.to_string(),
            content,
            created_at: Utc::now(),
        };
        if self.sink.send(entry).is_err() {
            log::warn!("Deployment log sink closed, dropping line for {deployment_id}");
        }
    }

    /// Writes to the realtime topic only, for output that is superseded
    /// before it is worth keeping.
    pub fn live(&self, deployment_id: &str, content: impl Into<String>) {
        self.broker
            .publish(&LogBroker::deployment_topic(deployment_id), content);
    }

    /// Logs a final line and tears down the realtime topic.
    pub fn finish(&self, deployment_id: &str, content: impl Into<String>) {
        self.log(deployment_id, content);
        self.broker
            .remove_topic(&LogBroker::deployment_topic(deployment_id));
    }
}

/// Buffers log lines and writes them to the store in batches.
pub struct LogSink {
    store: Arc<dyn EntityStore>,
    rx: mpsc::UnboundedReceiver<DeploymentLog>,
    buffer: Vec<DeploymentLog>,
    buffer_limit: usize,
    flush_interval: Duration,
}

impl LogSink {
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!("Deployment log sink started");
        let mut flush_interval = tokio::time::interval(self.flush_interval);
        // The first tick completes immediately.
        flush_interval.tick().await;

        loop {
            tokio::select! {
                maybe_entry = self.rx.recv() => {
                    match maybe_entry {
                        Some(entry) => {
                            self.buffer.push(entry);
                            if self.buffer.len() >= self.buffer_limit {
                                self.flush().await;
                            }
                        }
                        None => {
                            log::info!("Deployment log channel closed, flushing remaining lines");
                            self.flush().await;
                            break;
                        }
                    }
                }
                _ = flush_interval.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                }
                _ = shutdown.cancelled() => {
                    while let Ok(entry) = self.rx.try_recv() {
                        self.buffer.push(entry);
                    }
                    self.flush().await;
                    break;
                }
            }
        }
        log::info!("Deployment log sink stopped");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let start = Instant::now();
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.buffer_limit));
        let count = batch.len();
        match self.store.append_deployment_logs(batch).await {
            Ok(()) => log::debug!("Flushed {count} deployment log lines"),
            Err(e) => log::error!("Failed to write {count} deployment log lines: {e}"),
        }
        let duration = start.elapsed();
        if duration.as_secs() > 1 {
            log::warn!("Deployment log flush took {duration:?}");
        }
    }
}

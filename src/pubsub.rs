//! Topic based fan-out of log lines to live subscribers.

use dashmap::DashMap;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

#[derive(Default)]
pub struct LogBroker {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl LogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deployment_topic(deployment_id: &str) -> String {
        format!("deployment-log-{deployment_id}")
    }

    /// Publishes to a topic, creating it on first use. Returns how many
    /// subscribers received the line.
    pub fn publish(&self, topic: &str, line: impl Into<String>) -> usize {
        let sender = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone();
        sender.send(line.into()).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Drops the topic. Subscribers observe a closed channel once the last
    /// buffered line has been read.
    pub fn remove_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }

    #[cfg(test)]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}

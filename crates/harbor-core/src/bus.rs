//! Message bus
//!
//! Publish-subscribe channel shared by the host and every loaded plugin. Topics are
//! dot-separated strings (`host.plugin.loaded`); a subscription filter is either an
//! exact topic, a prefix ending in `.*`, or `*` for everything.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default number of buffered messages per subscriber
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// A message published on the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    /// Plugin id of the publisher, or `host`
    pub sender: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            sender: sender.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}

/// Broadcast message bus
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<BusMessage>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a message, returning the number of subscribers that will see it
    pub fn publish(&self, message: BusMessage) -> usize {
        debug!(topic = %message.topic, sender = %message.sender, "Publishing bus message");
        // No receivers is not an error
        self.sender.send(message).unwrap_or(0)
    }

    /// Subscribe to every message
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_to("*")
    }

    /// Subscribe to messages matching a topic filter
    pub fn subscribe_to(&self, filter: impl Into<String>) -> Subscription {
        Subscription {
            filter: filter.into(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Filtered receiver half of the bus
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next matching message
    ///
    /// Messages dropped because this subscriber lagged are skipped with a warning.
    pub async fn recv(&mut self) -> Result<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if topic_matches(&self.filter, &message.topic) => return Ok(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(filter = %self.filter, skipped, "Bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::BusClosed),
            }
        }
    }

    /// Return the next matching message if one is already buffered
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if topic_matches(&self.filter, &message.topic) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Whether `topic` is selected by `filter`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == "*" || filter == topic {
        return true;
    }
    match filter.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

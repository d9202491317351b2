//! Generic in-process pub/sub hub for real-time streaming.
//!
//! Provides topic-keyed broadcast channels for pushing values to SSE endpoints.
//! Topics are opaque strings; the hub has no knowledge of what's being streamed.
//!
//! # Usage
//!
//! Producers:
//!   hub.publish("execution:abc-123", event).await;
//!
//! Consumers (SSE endpoints):
//!   let rx = hub.subscribe("execution:abc-123").await;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Generic in-process pub/sub hub.
///
/// Thread-safe, cloneable. Keyed by string topics.
#[derive(Clone)]
pub struct StreamHub<T: Clone + Send + 'static> {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<T>>>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> StreamHub<T> {
    /// Create a new StreamHub with default capacity (1024 messages per channel).
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new StreamHub with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish a value to a topic. No-op if no subscribers.
    pub async fn publish(&self, topic: &str, value: T) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(topic) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(value);
        }
    }

    /// Subscribe to a topic. Creates the channel if it doesn't exist.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<T> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }
}

impl<T: Clone + Send + 'static> Default for StreamHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

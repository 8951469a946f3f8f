//! Fan-out of serialized summaries to live subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;

/// Broadcast hub for serialized endpoint snapshots.
///
/// Every subscriber gets its own bounded queue. A subscriber that falls more
/// than the buffer behind loses the oldest summaries instead of slowing
/// anyone else down. Subscribers only see summaries published after they
/// joined.
#[derive(Clone)]
pub struct Feed {
    tx: broadcast::Sender<Arc<str>>,
}

impl Feed {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Push one summary to everyone currently subscribed.
    ///
    /// Returns how many subscribers it was queued for.
    pub fn publish(&self, summary: Arc<str>) -> usize {
        self.tx.send(summary).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

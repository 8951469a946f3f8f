//! In-process broker backed by bounded tokio queues.

use super::{BrokerError, EventChannel, EventStream};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

struct Topic {
    tx: mpsc::Sender<Bytes>,
    /// Taken by the single consumer.
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Some(rx) }
    }
}

/// Queue-per-topic broker for single-process deployments.
///
/// Messages published before the consumer attaches stay queued. A topic has
/// at most one live consumer.
pub struct MemoryBroker {
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self, topic: &str) -> Result<mpsc::Sender<Bytes>, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let mut topics = self.topics.lock().map_err(|_| BrokerError::Closed)?;
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.capacity));
        Ok(entry.tx.clone())
    }
}

#[async_trait]
impl EventChannel for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let tx = self.sender(topic)?;
        tx.send(payload).await.map_err(|_| BrokerError::Publish {
            topic: topic.to_string(),
            reason: "consumer went away".to_string(),
        })
    }

    async fn subscribe(&self, topic: &str, _prefetch: usize) -> Result<EventStream, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let mut topics = self.topics.lock().map_err(|_| BrokerError::Closed)?;
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.capacity));

        // A dropped consumer leaves a dead queue behind; start a fresh one
        if entry.rx.is_none() && entry.tx.is_closed() {
            *entry = Topic::new(self.capacity);
        }

        let rx = entry.rx.take().ok_or_else(|| BrokerError::Subscribe {
            topic: topic.to_string(),
            reason: "topic already has a consumer".to_string(),
        })?;

        tracing::debug!("Memory broker: consumer attached to {}", topic);
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut topics) = self.topics.lock() {
            topics.clear();
        }
        tracing::debug!("Memory broker closed");
    }
}

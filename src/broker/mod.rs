//! Event channel between the agent, the aggregator and the presenter.
//!
//! Components only see [`EventChannel`]; the concrete transport is picked
//! from configuration by [`connect`].

mod memory;
mod nats;

pub use memory::*;
pub use nats::*;

use crate::config::{BrokerConfig, BrokerKind};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

/// Ordered stream of raw payloads from one topic.
pub type EventStream = BoxStream<'static, Bytes>;

/// Broker error types.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("broker connection closed")]
    Closed,
    #[error("subscription to {0} ended unexpectedly")]
    Disconnected(String),
}

/// A durable, ordered publish/subscribe transport.
#[async_trait]
pub trait EventChannel: Send + Sync + 'static {
    /// Publish one payload to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Start consuming `topic`. `prefetch` is a hint for how many messages
    /// may be buffered ahead of the consumer.
    async fn subscribe(&self, topic: &str, prefetch: usize) -> Result<EventStream, BrokerError>;

    /// Release the transport. Later publishes fail with [`BrokerError::Closed`].
    async fn close(&self);
}

/// Shared handle to an event channel.
pub type SharedChannel = Arc<dyn EventChannel>;

/// Open the event channel described by `cfg`.
pub async fn connect(cfg: &BrokerConfig) -> Result<SharedChannel, BrokerError> {
    match cfg.kind {
        BrokerKind::Memory => {
            tracing::info!("Using in-process broker (capacity {})", cfg.capacity);
            Ok(Arc::new(MemoryBroker::new(cfg.capacity)))
        }
        BrokerKind::Nats => {
            tracing::info!("Connecting to NATS at {}", cfg.address);
            Ok(Arc::new(NatsBroker::connect(&cfg.address).await?))
        }
    }
}

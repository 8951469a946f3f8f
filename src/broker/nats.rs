//! NATS JetStream broker for running the components as separate processes.
//!
//! Each topic is backed by a work-queue stream with one durable pull consumer,
//! so observations published while no consumer is attached are kept and every
//! message is delivered at least once. A message is acknowledged when the
//! consumer comes back for the next one, which means the previous message has
//! been handled.

use super::{BrokerError, EventChannel, EventStream};

use async_nats::jetstream::consumer::{pull, AckPolicy};
use async_nats::jetstream::stream::{self as js_stream, RetentionPolicy};
use async_nats::jetstream::{self, Context};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Reconnect attempts before the client gives up on the server.
const MAX_RECONNECTS: usize = 3;

/// Event channel over a NATS JetStream connection.
pub struct NatsBroker {
    addr: String,
    client: Client,
    jetstream: Context,
    /// Topics whose stream is known to exist.
    streams: Mutex<HashSet<String>>,
    closed: AtomicBool,
    /// Cancelled when the connection is lost or the broker is closed; ends every stream.
    gone: CancellationToken,
}

impl NatsBroker {
    pub async fn connect(addr: &str) -> Result<Self, BrokerError> {
        let gone = CancellationToken::new();
        let watcher = gone.clone();

        let options = ConnectOptions::new()
            .name("uptrail")
            .max_reconnects(Some(MAX_RECONNECTS))
            .event_callback(move |event| {
                let watcher = watcher.clone();
                async move {
                    if connection_lost(&event) {
                        tracing::error!("NATS: connection lost ({})", event);
                        watcher.cancel();
                    } else {
                        tracing::debug!("NATS: {}", event);
                    }
                }
            });

        let client = async_nats::connect_with_options(addr, options)
            .await
            .map_err(|e| BrokerError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            addr: addr.to_string(),
            client,
            jetstream,
            streams: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            gone,
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if self.gone.is_cancelled() {
            return Err(BrokerError::Connect {
                addr: self.addr.clone(),
                reason: "connection lost".to_string(),
            });
        }
        Ok(())
    }

    /// Create the topic's stream unless this broker already has.
    async fn ensure_stream(&self, topic: &str) -> Result<js_stream::Stream, String> {
        let stream = self
            .jetstream
            .get_or_create_stream(js_stream::Config {
                name: stream_name(topic),
                subjects: vec![topic.to_string()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| e.to_string())?;

        if let Ok(mut streams) = self.streams.lock() {
            if streams.insert(topic.to_string()) {
                tracing::debug!("NATS: stream {} ready for {}", stream_name(topic), topic);
            }
        }
        Ok(stream)
    }

    fn has_stream(&self, topic: &str) -> bool {
        self.streams
            .lock()
            .map(|streams| streams.contains(topic))
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventChannel for NatsBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let failed = |reason: String| BrokerError::Publish {
            topic: topic.to_string(),
            reason,
        };

        if !self.has_stream(topic) {
            self.ensure_stream(topic).await.map_err(failed)?;
        }

        // Returns once the server has stored the message
        self.jetstream
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| failed(e.to_string()))?
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, prefetch: usize) -> Result<EventStream, BrokerError> {
        self.ensure_open()?;
        let failed = |reason: String| BrokerError::Subscribe {
            topic: topic.to_string(),
            reason,
        };

        let stream = self.ensure_stream(topic).await.map_err(failed)?;
        let durable = consumer_name(topic);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: prefetch.max(1) as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| failed(e.to_string()))?;
        let messages = consumer.messages().await.map_err(|e| failed(e.to_string()))?;

        tracing::debug!("NATS: consuming {} as {} (prefetch {})", topic, durable, prefetch);
        Ok(deliveries(Delivery {
            topic: topic.to_string(),
            messages,
            unacked: None,
            gone: self.gone.clone(),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.gone.cancel();
        if let Err(e) = self.client.flush().await {
            tracing::warn!("NATS: failed to flush on close: {}", e);
        }
    }
}

/// Whether a connection event means the broker can no longer be relied on.
fn connection_lost(event: &Event) -> bool {
    matches!(event, Event::Closed | Event::Disconnected)
}

/// Stream names may not contain `.`, `*`, `>` or whitespace.
fn stream_name(topic: &str) -> String {
    let name: String = topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("UPTRAIL_{}", name.to_ascii_uppercase())
}

fn consumer_name(topic: &str) -> String {
    format!("{}_consumer", stream_name(topic).to_ascii_lowercase())
}

struct Delivery {
    topic: String,
    messages: pull::Stream,
    unacked: Option<jetstream::Message>,
    gone: CancellationToken,
}

/// Yield payloads in order, acknowledging each one when the next is requested.
///
/// The stream ends when the connection is lost, the broker is closed or the
/// consumer reports an error.
fn deliveries(delivery: Delivery) -> EventStream {
    futures::stream::unfold(delivery, |mut d| async move {
        if let Some(handled) = d.unacked.take() {
            if let Err(e) = handled.ack().await {
                tracing::warn!("NATS: failed to ack message on {}: {}", d.topic, e);
            }
        }

        let next = tokio::select! {
            _ = d.gone.cancelled() => return None,
            next = d.messages.next() => next,
        };

        match next {
            Some(Ok(msg)) => {
                let payload = msg.payload.clone();
                d.unacked = Some(msg);
                Some((payload, d))
            }
            Some(Err(e)) => {
                tracing::error!("NATS: consumer on {} failed: {}", d.topic, e);
                None
            }
            None => None,
        }
    })
    .boxed()
}

//! Aggregation of raw observations into per-endpoint summaries.
//!
//! The aggregator is the single consumer of the observations topic. It owns
//! every [`EndpointSummary`] and folds one observation at a time on the
//! consuming task.

mod summary;
mod window;

pub use summary::*;
pub use window::*;

use crate::broker::{BrokerError, SharedChannel};
use crate::config::BrokerConfig;
use crate::model::{decode, encode, Endpoint, Observation};

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Folds observations and republishes the updated summaries.
pub struct Aggregator {
    window_size: usize,
    servers: HashMap<Endpoint, EndpointSummary>,
}

impl Aggregator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            servers: HashMap::new(),
        }
    }

    /// Fold `obs` into its endpoint's summary, creating the summary on the
    /// endpoint's first observation.
    pub fn fold(&mut self, obs: &Observation) -> &EndpointSummary {
        let window_size = self.window_size;
        let summary = self
            .servers
            .entry(obs.endpoint.clone())
            .or_insert_with(|| {
                tracing::info!("Aggregator: tracking new endpoint {}", obs.endpoint);
                EndpointSummary::new(obs.endpoint.clone(), window_size)
            });
        summary.fold(obs);
        summary
    }

    pub fn get(&self, endpoint: &str) -> Option<&EndpointSummary> {
        self.servers.get(endpoint)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Consume observations until cancelled or the broker fails.
    ///
    /// A broker failure cancels `cancel` so the rest of the process winds
    /// down with it.
    pub async fn run(
        mut self,
        channel: SharedChannel,
        broker: &BrokerConfig,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        tracing::info!(
            "Aggregator consuming {} (window size {})",
            broker.observations_topic,
            self.window_size
        );

        let result = self.consume(&channel, broker, &cancel).await;

        // Shutdown is signalled before the shared channel closes
        if let Err(e) = &result {
            tracing::error!("Aggregator stopped: {}", e);
            cancel.cancel();
        } else {
            tracing::info!("Aggregator stopped ({} endpoints tracked)", self.len());
        }

        channel.close().await;
        result
    }

    async fn consume(
        &mut self,
        channel: &SharedChannel,
        broker: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut events = channel
            .subscribe(&broker.observations_topic, broker.prefetch)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.next() => {
                    let Some(payload) = event else {
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(BrokerError::Disconnected(broker.observations_topic.clone()));
                    };

                    if let Err(e) = self.handle(channel, &broker.summaries_topic, &payload).await {
                        // Teardown closes the shared channel under us
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        channel: &SharedChannel,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let obs: Observation = match decode(payload) {
            Ok(obs) => obs,
            Err(e) => {
                tracing::warn!("Aggregator: dropping observation: {}", e);
                return Ok(());
            }
        };

        let summary = self.fold(&obs);
        let window = summary.latency_window();
        tracing::info!(
            "{} alive={} avail.(%)={:.2} res={:?} min={:?} max={:?} avg={:?} status_codes={:?}",
            summary.endpoint(),
            summary.alive(),
            summary.availability(),
            summary.last_latency(),
            window.min(),
            window.max(),
            window.mean(),
            summary.status_histogram().counts()
        );

        let snapshot = summary.snapshot();
        match encode(&snapshot) {
            Ok(bytes) => channel.publish(topic, Bytes::from(bytes)).await,
            Err(e) => {
                tracing::warn!("Aggregator: failed to encode summary for {}: {}", obs.endpoint, e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{EventChannel, EventStream, MemoryBroker};
    use crate::model::{EndpointSnapshot, PROBE_FAILED_STATUS};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Channel whose subscriptions end at once, recording whether shutdown
    /// was already signalled when it got closed.
    struct EndedChannel {
        cancel: CancellationToken,
        cancelled_at_close: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl EventChannel for EndedChannel {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn subscribe(&self, _topic: &str, _prefetch: usize) -> Result<EventStream, BrokerError> {
            Ok(futures::stream::empty::<Bytes>().boxed())
        }

        async fn close(&self) {
            self.cancelled_at_close.store(self.cancel.is_cancelled(), Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn observation(endpoint: &str, status_code: u16, latency_ms: u64) -> Observation {
        Observation {
            endpoint: endpoint.to_string(),
            timestamp: Utc::now(),
            alive: status_code != PROBE_FAILED_STATUS,
            latency: Duration::from_millis(latency_ms),
            status_code,
            error: None,
        }
    }

    #[test]
    fn test_first_observation_is_folded() {
        let mut aggregator = Aggregator::new(120);
        assert!(aggregator.get("http://e").is_none());

        let summary = aggregator.fold(&observation("http://e", 404, 10));

        assert_eq!(summary.status_histogram().total(), 1);
        assert_eq!(summary.status_histogram().count(404), 1);
        assert_eq!(summary.availability(), 0.0);
        assert!(summary.alive());
        assert_eq!(summary.latency_window().len(), 1);
    }

    #[test]
    fn test_latency_window_scenario() {
        let mut aggregator = Aggregator::new(3);
        for latency in [45, 46, 62, 61] {
            aggregator.fold(&observation("E", 200, latency));
        }

        let summary = aggregator.get("E").unwrap();
        let window = summary.latency_window();
        let samples: Vec<_> = window.samples().collect();
        assert_eq!(
            samples,
            vec![
                Duration::from_millis(46),
                Duration::from_millis(62),
                Duration::from_millis(61)
            ]
        );
        assert_eq!(window.min(), Duration::from_millis(46));
        assert_eq!(window.max(), Duration::from_millis(62));
        assert!((window.mean().as_secs_f64() * 1000.0 - 56.333).abs() < 0.01);
        assert_eq!(summary.availability(), 100.0);
    }

    #[test]
    fn test_mixed_status_availability() {
        let mut aggregator = Aggregator::new(10);
        for code in [200, 404, 500] {
            aggregator.fold(&observation("E", code, 10));
        }
        let availability = aggregator.get("E").unwrap().availability();
        assert!((availability - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_endpoints_are_tracked_separately() {
        let mut aggregator = Aggregator::new(10);
        aggregator.fold(&observation("a", 200, 10));
        aggregator.fold(&observation("b", PROBE_FAILED_STATUS, 10));
        aggregator.fold(&observation("a", 200, 20));

        assert_eq!(aggregator.len(), 2);
        assert_eq!(aggregator.get("a").unwrap().availability(), 100.0);
        assert_eq!(aggregator.get("b").unwrap().availability(), 0.0);
        assert!(!aggregator.get("b").unwrap().alive());
    }

    #[tokio::test]
    async fn test_run_republishes_and_skips_malformed() {
        let broker = Arc::new(MemoryBroker::new(16));
        let channel: SharedChannel = broker.clone();
        let cfg = BrokerConfig::default();
        let cancel = CancellationToken::new();

        let mut summaries = broker.subscribe(&cfg.summaries_topic, 1).await.unwrap();

        let first = encode(&observation("http://e", 200, 10)).unwrap();
        let second = encode(&observation("http://e", 500, 30)).unwrap();
        broker.publish(&cfg.observations_topic, Bytes::from(first)).await.unwrap();
        broker.publish(&cfg.observations_topic, Bytes::from_static(b"not json")).await.unwrap();
        broker.publish(&cfg.observations_topic, Bytes::from(second)).await.unwrap();

        let task = tokio::spawn({
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            async move { Aggregator::new(5).run(channel, &cfg, cancel).await }
        });

        let one: EndpointSnapshot = decode(&summaries.next().await.unwrap()).unwrap();
        let two: EndpointSnapshot = decode(&summaries.next().await.unwrap()).unwrap();
        assert_eq!(one.availability, 100.0);
        assert_eq!(two.availability, 50.0);
        assert_eq!(two.samples, 2);
        assert_eq!(two.status_codes.get(&500), Some(&1));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_fails_when_broker_goes_away() {
        let broker = Arc::new(MemoryBroker::new(16));
        let channel: SharedChannel = broker.clone();
        let cfg = BrokerConfig::default();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            async move { Aggregator::new(5).run(channel, &cfg, cancel).await }
        });

        // Let the aggregator attach before pulling the rug
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(BrokerError::Disconnected(_))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_failure_cancels_before_closing_channel() {
        let cancel = CancellationToken::new();
        let ended = Arc::new(EndedChannel {
            cancel: cancel.clone(),
            cancelled_at_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let channel: SharedChannel = ended.clone();

        let result = Aggregator::new(5)
            .run(channel, &BrokerConfig::default(), cancel.clone())
            .await;

        assert!(matches!(result, Err(BrokerError::Disconnected(_))));
        assert!(ended.closed.load(Ordering::SeqCst));
        assert!(ended.cancelled_at_close.load(Ordering::SeqCst));
    }
}

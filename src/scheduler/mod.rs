//! Scheduler module for running probes on a fixed cadence.
//!
//! Every endpoint gets one worker task with a single-slot mailbox. Each
//! sweep drops the endpoint into its worker's mailbox; a worker still busy
//! with the previous probe makes the sweep skip it, so probes of the same
//! endpoint never overlap or pile up.

use crate::broker::{BrokerError, SharedChannel};
use crate::model::{encode, Endpoint};
use crate::probe::Prober;

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Drives probe sweeps over the configured endpoints.
pub struct Scheduler {
    endpoints: Vec<Endpoint>,
    interval: Duration,
    prober: Arc<dyn Prober>,
    channel: SharedChannel,
    topic: String,
}

impl Scheduler {
    pub fn new(
        endpoints: Vec<Endpoint>,
        interval: Duration,
        prober: Arc<dyn Prober>,
        channel: SharedChannel,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            endpoints: unique_endpoints(endpoints),
            interval,
            prober,
            channel,
            topic: topic.into(),
        }
    }

    /// Sweep until `cancel` fires or publishing fails.
    ///
    /// Waits for every worker to stop and closes the channel before
    /// returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BrokerError> {
        tracing::info!("Monitoring agent starting");
        tracing::info!("Refresh interval: {:?}", self.interval);
        tracing::info!("Monitoring {} endpoints:", self.endpoints.len());
        for endpoint in &self.endpoints {
            tracing::info!("  - {}", endpoint);
        }

        let mut workers = JoinSet::new();
        let mut mailboxes = Vec::with_capacity(self.endpoints.len());

        for endpoint in &self.endpoints {
            let (tx, rx) = mpsc::channel(1);
            workers.spawn(run_worker(
                rx,
                self.prober.clone(),
                self.channel.clone(),
                self.topic.clone(),
                cancel.clone(),
            ));
            mailboxes.push((endpoint.clone(), tx));
        }

        run_sweeps(&mailboxes, self.interval, &cancel).await;
        drop(mailboxes);

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => tracing::error!("Probe worker panicked: {}", e),
            }
        }

        self.channel.close().await;
        tracing::info!("Monitoring agent stopped");
        result
    }
}

/// Drop repeated endpoints, keeping the first occurrence of each.
///
/// One worker per endpoint is what bounds it to a single probe in flight.
fn unique_endpoints(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::with_capacity(endpoints.len());
    endpoints
        .into_iter()
        .filter(|endpoint| {
            let first = seen.insert(endpoint.clone());
            if !first {
                tracing::warn!("Ignoring duplicate endpoint {}", endpoint);
            }
            first
        })
        .collect()
}

/// Dispatch every endpoint once per tick, in configuration order.
async fn run_sweeps(
    mailboxes: &[(Endpoint, mpsc::Sender<Endpoint>)],
    interval: Duration,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for (endpoint, tx) in mailboxes {
                    match tx.try_send(endpoint.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!("Skipping probe for {} due to overlap limit", endpoint);
                        }
                        Err(TrySendError::Closed(_)) => {
                            tracing::debug!("Worker for {} has stopped", endpoint);
                        }
                    }
                }
            }
        }
    }
}

/// Probe whatever lands in the mailbox and publish the observation.
async fn run_worker(
    mut rx: mpsc::Receiver<Endpoint>,
    prober: Arc<dyn Prober>,
    channel: SharedChannel,
    topic: String,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    loop {
        let endpoint = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = rx.recv() => match next {
                Some(endpoint) => endpoint,
                None => return Ok(()),
            },
        };

        let obs = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            obs = prober.probe(&endpoint) => obs,
        };

        let payload = match encode(&obs) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to encode observation for {}: {}", endpoint, e);
                continue;
            }
        };

        let published = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            published = channel.publish(&topic, Bytes::from(payload)) => published,
        };

        if let Err(e) = published {
            tracing::error!("Failed to publish observation for {}: {}", endpoint, e);
            cancel.cancel();
            return Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{EventChannel, EventStream, MemoryBroker};
    use crate::model::{decode, Observation};
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    const TOPIC: &str = "urlstatus";

    /// Answers instantly except for endpoints listed in `delays`.
    #[derive(Default)]
    struct FakeProber {
        delays: HashMap<String, Duration>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
    }

    impl FakeProber {
        fn with_delay(endpoint: &str, delay: Duration) -> Self {
            let mut prober = Self::default();
            prober.delays.insert(endpoint.to_string(), delay);
            prober
        }

        fn enter(&self, endpoint: &str) {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(endpoint.to_string()).or_insert(0);
            *count += 1;
            self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
        }

        fn leave(&self, endpoint: &str) {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(count) = in_flight.get_mut(endpoint) {
                *count -= 1;
            }
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, endpoint: &str) -> Observation {
            self.enter(endpoint);
            if let Some(delay) = self.delays.get(endpoint) {
                tokio::time::sleep(*delay).await;
            }
            self.leave(endpoint);

            Observation {
                endpoint: endpoint.to_string(),
                timestamp: Utc::now(),
                alive: true,
                latency: Duration::from_millis(1),
                status_code: 200,
                error: None,
            }
        }
    }

    fn endpoints(names: &[&str]) -> Vec<Endpoint> {
        names.iter().map(|n| n.to_string()).collect()
    }

    async fn drain(stream: &mut EventStream) -> Vec<Observation> {
        let mut seen = Vec::new();
        while let Ok(Some(payload)) =
            tokio::time::timeout(Duration::from_millis(20), stream.next()).await
        {
            seen.push(decode(&payload).unwrap());
        }
        seen
    }

    #[tokio::test]
    async fn test_every_endpoint_probed_each_sweep() {
        let broker = Arc::new(MemoryBroker::new(1024));
        let mut stream = broker.subscribe(TOPIC, 1).await.unwrap();
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(
            endpoints(&["http://a", "http://b", "http://c"]),
            Duration::from_millis(30),
            Arc::new(FakeProber::default()),
            broker.clone(),
            TOPIC,
        );
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let seen = drain(&mut stream).await;
        for endpoint in ["http://a", "http://b", "http://c"] {
            let count = seen.iter().filter(|o| o.endpoint == endpoint).count();
            assert!(count >= 2, "{} probed {} times", endpoint, count);
        }
    }

    #[tokio::test]
    async fn test_slow_endpoint_never_overlaps() {
        let broker = Arc::new(MemoryBroker::new(1024));
        let mut stream = broker.subscribe(TOPIC, 1).await.unwrap();
        let cancel = CancellationToken::new();
        let prober = Arc::new(FakeProber::with_delay("http://slow", Duration::from_millis(150)));

        let scheduler = Scheduler::new(
            endpoints(&["http://slow", "http://fast"]),
            Duration::from_millis(20),
            prober.clone(),
            broker.clone(),
            TOPIC,
        );
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let seen = drain(&mut stream).await;
        let slow = seen.iter().filter(|o| o.endpoint == "http://slow").count();
        let fast = seen.iter().filter(|o| o.endpoint == "http://fast").count();

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(slow <= 3, "slow endpoint probed {} times", slow);
        assert!(fast > slow);
    }

    #[test]
    fn test_unique_endpoints_keeps_first_order() {
        let unique = unique_endpoints(endpoints(&["http://b", "http://a", "http://b", "http://c", "http://a"]));
        assert_eq!(unique, endpoints(&["http://b", "http://a", "http://c"]));
    }

    #[tokio::test]
    async fn test_repeated_endpoint_gets_one_worker() {
        let broker = Arc::new(MemoryBroker::new(1024));
        let mut stream = broker.subscribe(TOPIC, 1).await.unwrap();
        let cancel = CancellationToken::new();
        let prober = Arc::new(FakeProber::with_delay("http://slow", Duration::from_millis(150)));

        let scheduler = Scheduler::new(
            endpoints(&["http://slow", "http://slow"]),
            Duration::from_millis(20),
            prober.clone(),
            broker.clone(),
            TOPIC,
        );
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        let seen = drain(&mut stream).await;
        assert!(seen.len() <= 2, "slow endpoint published {} times", seen.len());
    }

    #[tokio::test]
    async fn test_cancel_during_probe_returns_promptly() {
        let broker = Arc::new(MemoryBroker::new(16));
        let cancel = CancellationToken::new();
        let prober = Arc::new(FakeProber::with_delay("http://stuck", Duration::from_secs(30)));

        let scheduler = Scheduler::new(
            endpoints(&["http://stuck"]),
            Duration::from_millis(10),
            prober,
            broker.clone(),
            TOPIC,
        );
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = Instant::now();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok(), "scheduler did not stop");
        assert!(start.elapsed() < Duration::from_secs(1));

        // The publish handle is released on the way out
        assert!(matches!(
            broker.publish(TOPIC, Bytes::from_static(b"x")).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_stops_everything() {
        let broker = Arc::new(MemoryBroker::new(16));
        broker.close().await;
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(
            endpoints(&["http://a", "http://b"]),
            Duration::from_millis(10),
            Arc::new(FakeProber::default()),
            broker,
            TOPIC,
        );

        let result = tokio::time::timeout(Duration::from_secs(1), scheduler.run(cancel.clone()))
            .await
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(cancel.is_cancelled());
    }
}

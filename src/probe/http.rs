//! HTTP probe implementation.

use super::{ProbeError, Prober};
use crate::model::{Observation, ProbeFailure, PROBE_FAILED_STATUS};

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};

/// Probes endpoints with a single GET request.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    jitter: Duration,
}

impl HttpProber {
    /// Create a prober whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            jitter: Duration::ZERO,
        })
    }

    /// Sleep a random delay up to `jitter` before every probe.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    async fn sleep_jitter(&self) {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return;
        }
        let delay = rand::random::<u64>() % (bound + 1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &str) -> Observation {
        // Add jitter to avoid thundering herd
        self.sleep_jitter().await;

        let url = normalize_url(endpoint);
        let timestamp = Utc::now();
        let start = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) => {
                // Clocked at the headers, like a plain GET round trip
                let latency = start.elapsed();
                let status_code = response.status().as_u16();

                // Drain the body so the connection can be reused
                let error = match response.bytes().await {
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!("Failed to read body from {}: {}", endpoint, e);
                        Some(ProbeFailure::Body)
                    }
                };

                Observation {
                    endpoint: endpoint.to_string(),
                    timestamp,
                    alive: true,
                    latency,
                    status_code,
                    error,
                }
            }
            Err(e) => {
                let latency = start.elapsed();
                tracing::warn!("Probe failed for {}: {}", endpoint, e);

                Observation {
                    endpoint: endpoint.to_string(),
                    timestamp,
                    alive: false,
                    latency,
                    status_code: PROBE_FAILED_STATUS,
                    error: Some(classify(&e)),
                }
            }
        }
    }
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn classify(error: &reqwest::Error) -> ProbeFailure {
    if error.is_timeout() {
        ProbeFailure::Timeout
    } else if error.is_connect() {
        ProbeFailure::Connect
    } else {
        ProbeFailure::Request
    }
}

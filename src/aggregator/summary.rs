//! Per-endpoint accumulated statistics.

use super::RollingWindow;
use crate::model::{Endpoint, EndpointSnapshot, Observation, ERROR_STATUS_THRESHOLD};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Occurrence count per status code. Counts only ever grow.
#[derive(Debug, Clone, Default)]
pub struct StatusHistogram {
    counts: BTreeMap<u16, u64>,
}

impl StatusHistogram {
    pub fn record(&mut self, status_code: u16) {
        *self.counts.entry(status_code).or_insert(0) += 1;
    }

    pub fn count(&self, status_code: u16) -> u64 {
        self.counts.get(&status_code).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn errors(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(code, _)| **code >= ERROR_STATUS_THRESHOLD)
            .map(|(_, count)| count)
            .sum()
    }

    /// Percentage of non-error codes, `None` when nothing was recorded.
    pub fn availability(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let valid = total - self.errors();
        Some(valid as f64 * 100.0 / total as f64)
    }

    pub fn counts(&self) -> &BTreeMap<u16, u64> {
        &self.counts
    }
}

/// Rolling summary of everything observed for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointSummary {
    endpoint: Endpoint,
    alive: bool,
    latency_window: RollingWindow,
    status_histogram: StatusHistogram,
    availability: f64,
    last_latency: Duration,
    updated_at: DateTime<Utc>,
}

impl EndpointSummary {
    pub fn new(endpoint: Endpoint, window_size: usize) -> Self {
        Self {
            endpoint,
            alive: false,
            latency_window: RollingWindow::new(window_size),
            status_histogram: StatusHistogram::default(),
            availability: 0.0,
            last_latency: Duration::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Fold one observation into the summary.
    pub fn fold(&mut self, obs: &Observation) {
        self.status_histogram.record(obs.status_code);
        self.availability = self.status_histogram.availability().unwrap_or(0.0);
        self.alive = obs.alive;
        self.last_latency = obs.latency;
        self.latency_window.put(obs.latency);
        self.updated_at = obs.timestamp;
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn alive(&self) -> bool {
        self.alive
    }

    pub fn availability(&self) -> f64 {
        self.availability
    }

    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    pub fn latency_window(&self) -> &RollingWindow {
        &self.latency_window
    }

    pub fn status_histogram(&self) -> &StatusHistogram {
        &self.status_histogram
    }

    /// Wire form of the current state.
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            endpoint: self.endpoint.clone(),
            timestamp: self.updated_at,
            alive: self.alive,
            availability: self.availability,
            last_latency: self.last_latency,
            mean_latency: self.latency_window.mean(),
            min_latency: self.latency_window.min(),
            max_latency: self.latency_window.max(),
            samples: self.latency_window.len(),
            status_codes: self.status_histogram.counts().clone(),
        }
    }
}

//! Probe module for endpoint monitoring.
//!
//! A probe never fails from the caller's point of view: transport problems
//! are folded into a degraded [`Observation`].

mod http;

pub use http::*;

use crate::model::Observation;

use async_trait::async_trait;
use thiserror::Error;

/// Probe setup errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Something that can check one endpoint and report what it saw.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, endpoint: &str) -> Observation;
}

//! Record types carried on the event channel.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// A monitored URL.
pub type Endpoint = String;

/// Status code recorded when the probe never got an HTTP response.
///
/// Sits outside the range real servers send and above the error threshold,
/// so availability always counts it as a failure.
pub const PROBE_FAILED_STATUS: u16 = 599;

/// Status codes at or above this value count against availability.
pub const ERROR_STATUS_THRESHOLD: u16 = 400;

/// Why a probe did not produce a clean HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    Timeout,
    Connect,
    Request,
    /// Headers arrived but the body could not be read.
    Body,
}

/// One probe outcome for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub endpoint: Endpoint,
    pub timestamp: DateTime<Utc>,
    pub alive: bool,
    pub latency: Duration,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeFailure>,
}

/// Aggregated state of one endpoint, as republished to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub endpoint: Endpoint,
    pub timestamp: DateTime<Utc>,
    pub alive: bool,
    pub availability: f64,
    pub last_latency: Duration,
    pub mean_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub samples: usize,
    pub status_codes: BTreeMap<u16, u64>,
}

/// Wire codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a record for the event channel.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(record)?)
}

/// Deserialize a record received from the event channel.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_wire_fields() {
        let obs = Observation {
            endpoint: "http://localhost:7892".to_string(),
            timestamp: Utc::now(),
            alive: false,
            latency: Duration::from_millis(12),
            status_code: PROBE_FAILED_STATUS,
            error: Some(ProbeFailure::Timeout),
        };

        let value: serde_json::Value = serde_json::from_slice(&encode(&obs).unwrap()).unwrap();
        assert_eq!(value["endpoint"], "http://localhost:7892");
        assert_eq!(value["status_code"], 599);
        assert_eq!(value["error"], "timeout");
        assert_eq!(value["alive"], false);

        let back: Observation = decode(&encode(&obs).unwrap()).unwrap();
        assert_eq!(back, obs);
    }

    #[test]
    fn test_error_field_omitted_when_clean() {
        let obs = Observation {
            endpoint: "http://a".to_string(),
            timestamp: Utc::now(),
            alive: true,
            latency: Duration::from_millis(3),
            status_code: 200,
            error: None,
        };
        let text = String::from_utf8(encode(&obs).unwrap()).unwrap();
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn test_decode_malformed() {
        let result = decode::<Observation>(b"{\"endpoint\": 42");
        assert!(matches!(result, Err(CodecError::Json(_))));
    }
}

//! Validated results produced by a test run.
//!
//! A `ResultsRecord` is built once at the end of a run and never mutated.
//! It is either valid (every required metric present and well-formed) or
//! invalid (no metrics, only a failure reason). Consumers must check
//! [`ResultsRecord::is_valid`] before trusting the metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Metrics a record must carry to be considered valid.
pub const REQUIRED_METRICS: &[&str] = &["latency_ms", "throughput_mbps"];

/// Unique identifier for a results record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single named measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Number(value as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            MetricValue::Number(n) => write!(f, "{:.2}", n),
            MetricValue::Text(s) => write!(f, "{}", s),
        }
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

/// Outcome of a single test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct ResultsRecord {
    id: RecordId,
    valid: bool,
    recorded_at: DateTime<Utc>,
    metrics: Metrics,
    failure: Option<String>,
}

/// Unchecked wire shape; converted through `TryFrom` so the validity
/// invariant holds for records that crossed a process boundary.
#[derive(Deserialize)]
struct RawRecord {
    id: RecordId,
    valid: bool,
    recorded_at: DateTime<Utc>,
    #[serde(default)]
    metrics: Metrics,
    #[serde(default)]
    failure: Option<String>,
}

impl TryFrom<RawRecord> for ResultsRecord {
    type Error = Error;

    fn try_from(raw: RawRecord) -> Result<Self> {
        if raw.valid {
            validate_metrics(&raw.metrics).map_err(Error::InvalidRecord)?;
        } else if !raw.metrics.is_empty() {
            return Err(Error::InvalidRecord(
                "invalid record must not carry metrics".to_string(),
            ));
        }
        Ok(Self {
            id: raw.id,
            valid: raw.valid,
            recorded_at: raw.recorded_at,
            metrics: raw.metrics,
            failure: if raw.valid { None } else { raw.failure },
        })
    }
}

impl ResultsRecord {
    /// Build a record from raw measurements.
    ///
    /// Yields a valid record only when every entry of [`REQUIRED_METRICS`]
    /// is a finite, non-negative number; otherwise the metrics are discarded
    /// and an invalid record describing the first problem is returned.
    pub fn from_metrics(metrics: Metrics) -> Self {
        match validate_metrics(&metrics) {
            Ok(()) => Self {
                id: RecordId::new(),
                valid: true,
                recorded_at: Utc::now(),
                metrics,
                failure: None,
            },
            Err(reason) => Self::invalid(reason),
        }
    }

    /// An invalid record carrying no usable metrics.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            valid: false,
            recorded_at: Utc::now(),
            metrics: Metrics::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    /// Why the run failed, for invalid records.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn validate_metrics(metrics: &Metrics) -> std::result::Result<(), String> {
    for name in REQUIRED_METRICS {
        match metrics.get(*name) {
            None => return Err(format!("missing metric '{}'", name)),
            Some(MetricValue::Text(_)) => {
                return Err(format!("metric '{}' is not numeric", name))
            }
            Some(MetricValue::Number(n)) if !n.is_finite() || *n < 0.0 => {
                return Err(format!("metric '{}' is out of range: {}", name, n))
            }
            Some(MetricValue::Number(_)) => {}
        }
    }
    Ok(())
}

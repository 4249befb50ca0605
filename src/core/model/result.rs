use std::{collections::BTreeMap, time::SystemTime};

use serde::Serialize;
use serde_json::{Map, Value};

/// State reported when the source exists and was read.
pub const STATE_ONLINE: &str = "online";
/// State reported when the configured source is not present.
pub const STATE_NOT_FOUND: &str = "not_found";
/// State reported when reading the source failed.
pub const STATE_ERROR: &str = "error";

/// One metric value as it appears in the JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    /// Floats rounded to two decimals; other values unchanged.
    pub fn rounded(&self) -> MetricValue {
        match self {
            MetricValue::Float(v) => MetricValue::Float(round2(*v)),
            other => other.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, MetricValue::Int(_) | MetricValue::Float(_))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Int(i64::from(v))
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(i64::from(v))
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// Outcome of one poll.
///
/// An unavailable result never carries data: [`CollectionResult::with`] and
/// [`CollectionResult::set`] are no-ops on it, so a dead source cannot publish
/// stale numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionResult {
    data: BTreeMap<String, MetricValue>,
    pub state: String,
    pub available: bool,
    pub error: Option<String>,
    pub timestamp: SystemTime,
}

impl CollectionResult {
    pub fn available(state: impl Into<String>) -> Self {
        Self {
            data: BTreeMap::new(),
            state: state.into(),
            available: true,
            error: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn online() -> Self {
        Self::available(STATE_ONLINE)
    }

    pub fn unavailable(state: impl Into<String>, error: Option<String>) -> Self {
        Self {
            data: BTreeMap::new(),
            state: state.into(),
            available: false,
            error,
            timestamp: SystemTime::now(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::unavailable(STATE_NOT_FOUND, Some(reason.into()))
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::unavailable(STATE_ERROR, Some(reason.into()))
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetricValue>) {
        if self.available {
            self.data.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.data.get(key)
    }

    pub fn data(&self) -> &BTreeMap<String, MetricValue> {
        &self.data
    }

    /// Drops any data if the result is unavailable.
    pub fn normalized(mut self) -> Self {
        if !self.available {
            self.data.clear();
        }
        self
    }

    /// JSON object published on the source topic.
    ///
    /// Available results carry every metric (floats rounded to two decimals)
    /// plus `state` when `include_state` is set. Unavailable results carry
    /// only `state`, whatever `include_state` says.
    pub fn to_payload(&self, include_state: bool) -> Value {
        let mut object = Map::new();

        if self.available {
            for (key, value) in &self.data {
                let value = serde_json::to_value(value.rounded()).unwrap_or(Value::Null);
                object.insert(key.clone(), value);
            }
            if include_state {
                object.insert("state".into(), Value::String(self.state.clone()));
            }
        } else {
            object.insert("state".into(), Value::String(self.state.clone()));
        }

        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_rounds_floats() {
        let result = CollectionResult::available("running")
            .with("cpu_percent", 12.3456)
            .with("threads", 8u32)
            .with("name", "nginx");

        assert_eq!(
            result.to_payload(true),
            json!({"cpu_percent": 12.35, "threads": 8, "name": "nginx", "state": "running"})
        );
    }

    #[test]
    fn test_host_payload_has_no_state() {
        let result = CollectionResult::online().with("load_1m", 0.5);
        assert_eq!(result.to_payload(false), json!({"load_1m": 0.5}));
    }

    #[test]
    fn test_unavailable_result_never_carries_data() {
        let result = CollectionResult::not_found("process exited")
            .with("cpu_percent", 99.0)
            .with("memory_mb", 512u64);

        assert!(result.data().is_empty());
        assert_eq!(result.to_payload(true), json!({"state": "not_found"}));
        assert_eq!(result.to_payload(false), json!({"state": "not_found"}));
    }

    #[test]
    fn test_normalized_clears_data_of_unavailable() {
        let mut result = CollectionResult::online().with("value", 1.0);
        result.available = false;
        result.state = STATE_ERROR.into();

        let result = result.normalized();
        assert!(result.data().is_empty());
        let payload = result.to_payload(true);
        assert!(payload
            .as_object()
            .unwrap()
            .values()
            .all(|v| !v.is_number()));
    }

    #[test]
    fn test_large_unsigned_saturates() {
        assert_eq!(MetricValue::from(u64::MAX), MetricValue::Int(i64::MAX));
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(MetricValue::from(3u32).as_f64(), Some(3.0));
        assert_eq!(MetricValue::from("x").as_f64(), None);
        assert!(MetricValue::from(1.5).is_numeric());
    }
}

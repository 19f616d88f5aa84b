//! Normalized records handed to the engine by data-source connectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single field value of a normalized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Numeric view of the value. Strings count when they parse as a finite float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) if f.is_finite() => Some(*f),
            Scalar::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

/// One normalized unit of ingested data (log line, DB row, API item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Scalar>,
    pub raw_text: String,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            source_id: source_id.into(),
            fields: BTreeMap::new(),
            raw_text: raw_text.into(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }
}

/// Inclusive time window used to restrict a data-source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Sort records into the canonical `(timestamp, id)` order the pipeline runs on.
pub fn canonical_order(records: &mut [Record]) {
    records.sort_by(canonical_cmp);
}

fn canonical_cmp(a: &Record, b: &Record) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.raw_text.cmp(&b.raw_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scalar_numeric_view() {
        assert_eq!(Scalar::Int(503).as_f64(), Some(503.0));
        assert_eq!(Scalar::from("12.5").as_f64(), Some(12.5));
        assert_eq!(Scalar::from("GET /health").as_f64(), None);
        assert_eq!(Scalar::Float(f64::NAN).as_f64(), None);
        assert_eq!(Scalar::Null.as_f64(), None);
    }

    #[test]
    fn test_scalar_deserializes_untagged() {
        let fields: BTreeMap<String, Scalar> =
            serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": "x", "d": true, "e": null}"#).unwrap();
        assert_eq!(fields["a"], Scalar::Int(1));
        assert_eq!(fields["b"], Scalar::Float(2.5));
        assert_eq!(fields["c"], Scalar::Text("x".into()));
        assert_eq!(fields["d"], Scalar::Bool(true));
        assert_eq!(fields["e"], Scalar::Null);
    }

    #[test]
    fn test_canonical_order_breaks_timestamp_ties_by_id() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut records = vec![
            Record::new("b", ts, "api", "second"),
            Record::new("c", ts - chrono::Duration::seconds(1), "api", "first"),
            Record::new("a", ts, "api", "also second"),
        ];
        canonical_order(&mut records);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}

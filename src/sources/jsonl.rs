//! JSON-lines file connector: one JSON object per line.
//!
//! Recognized keys are `id`, `timestamp` (also `ts`/`time`; RFC 3339 or epoch
//! seconds/milliseconds), `source` and `message` (also `raw`/`msg`). Every
//! other scalar key becomes a record field. A line without an `id` is named
//! after its line number.

use super::{ConnectorError, DataSource, DataSourceRef, RecordStream};
use crate::record::{Record, Scalar, TimeRange};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};

pub const KIND: &str = "jsonl";

const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "ts", "time"];
const MESSAGE_KEYS: [&str; 3] = ["message", "raw", "msg"];

pub struct JsonLinesSource;

impl DataSource for JsonLinesSource {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn stream(&self, source: &DataSourceRef, range: Option<&TimeRange>) -> Result<RecordStream, ConnectorError> {
        if source.location.trim().is_empty() {
            return Err(ConnectorError::config_invalid("jsonl source needs a file path"));
        }
        let file = File::open(&source.location)
            .map_err(|e| ConnectorError::unreachable(format!("cannot open {}: {}", source.location, e)))?;

        let default_source = source
            .options
            .get("source")
            .cloned()
            .unwrap_or_else(|| source.location.clone());
        let range = range.copied();

        let lines = BufReader::new(file).lines().enumerate();
        Ok(Box::new(lines.filter_map(move |(idx, line)| {
            let line_no = idx + 1;
            let line = match line {
                Ok(l) => l,
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    return Some(Err(ConnectorError::parse(format!("line {}: {}", line_no, e))))
                }
                Err(e) => return Some(Err(ConnectorError::unreachable(format!("read failed at line {}: {}", line_no, e)))),
            };
            if line.trim().is_empty() {
                return None;
            }
            match parse_line(&line, line_no, &default_source) {
                Ok(record) if range.map_or(true, |r| r.contains(record.timestamp)) => Some(Ok(record)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })))
    }
}

fn parse_line(line: &str, line_no: usize, default_source: &str) -> Result<Record, ConnectorError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ConnectorError::parse(format!("line {}: {}", line_no, e)))?;
    let Value::Object(mut obj) = value else {
        return Err(ConnectorError::parse(format!("line {}: expected a JSON object", line_no)));
    };

    let timestamp = take_first(&mut obj, &TIMESTAMP_KEYS)
        .ok_or_else(|| ConnectorError::parse(format!("line {}: missing timestamp", line_no)))
        .and_then(|v| parse_timestamp(&v).ok_or_else(|| ConnectorError::parse(format!("line {}: bad timestamp {}", line_no, v))))?;

    let id = match obj.remove("id") {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(ConnectorError::parse(format!("line {}: unsupported id {}", line_no, other))),
        None => format!("line-{}", line_no),
    };
    let source = match obj.remove("source") {
        Some(Value::String(s)) => s,
        _ => default_source.to_string(),
    };
    let raw_text = match take_first(&mut obj, &MESSAGE_KEYS) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => line.to_string(),
    };

    let mut record = Record::new(id, timestamp, source, raw_text);
    for (key, value) in obj {
        if let Some(scalar) = to_scalar(value) {
            record.fields.insert(key, scalar);
        }
    }
    Ok(record)
}

fn take_first(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|k| obj.remove(*k))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            // Values this large are epoch milliseconds.
            let millis = if secs.abs() >= 1e11 { secs } else { secs * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

fn to_scalar(value: Value) -> Option<Scalar> {
    match value {
        Value::Null => Some(Scalar::Null),
        Value::Bool(b) => Some(Scalar::Bool(b)),
        Value::Number(n) => n
            .as_i64()
            .map(Scalar::Int)
            .or_else(|| n.as_f64().map(Scalar::Float)),
        Value::String(s) => Some(Scalar::Text(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

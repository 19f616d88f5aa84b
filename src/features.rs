//! Feature extraction: records in, numeric vectors and category tallies out.
//!
//! Every vector of a job is aligned to the same ordered list of feature
//! names so the outlier model can compare them dimension by dimension.

use crate::record::{Record, Scalar};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Number of leading tokens kept in a message template.
const TEMPLATE_TOKENS: usize = 8;

/// Tokens counted in the raw text of every record.
const LEVEL_TOKENS: [(&str, &str); 3] = [
    ("error_tokens", "ERROR"),
    ("warn_tokens", "WARN"),
    ("fatal_tokens", "FATAL"),
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("grouping key has no components")]
    EmptyGrouping,
}

/// One component of the category grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GroupComponent {
    /// The record's `source_id`.
    Source,
    /// The normalized message template of `raw_text`.
    Template,
    /// The value of a named field (empty when absent).
    Field(String),
}

impl TryFrom<String> for GroupComponent {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "source" => Ok(GroupComponent::Source),
            "template" => Ok(GroupComponent::Template),
            other => match other.strip_prefix("field:") {
                Some(name) if !name.is_empty() => Ok(GroupComponent::Field(name.to_string())),
                _ => Err(format!(
                    "invalid grouping component '{}': expected source, template or field:<name>",
                    other
                )),
            },
        }
    }
}

impl From<GroupComponent> for String {
    fn from(value: GroupComponent) -> Self {
        value.to_string()
    }
}

impl fmt::Display for GroupComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupComponent::Source => write!(f, "source"),
            GroupComponent::Template => write!(f, "template"),
            GroupComponent::Field(name) => write!(f, "field:{}", name),
        }
    }
}

pub fn default_grouping() -> Vec<GroupComponent> {
    vec![GroupComponent::Source, GroupComponent::Template]
}

/// Derived view of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    /// Grouping key value; the issue class used for bursts and fingerprints.
    pub category: String,
    /// Numeric attributes aligned to [`FeatureSet::names`].
    pub values: Vec<f64>,
    /// Text fields that are not numeric.
    pub labels: BTreeMap<String, String>,
    /// Occurrences of `category` so far in the stream, this record included.
    pub rolling_count: u64,
}

/// Running per-category frequency table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrequencyTable {
    counts: BTreeMap<String, u64>,
}

impl FrequencyTable {
    /// Count one more occurrence and return the running total.
    pub fn record(&mut self, category: &str) -> u64 {
        let count = self.counts.entry(category.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, category: &str) -> u64 {
        self.counts.get(category).copied().unwrap_or(0)
    }

    /// Distinct categories seen.
    pub fn category_count(&self) -> usize {
        self.counts.len()
    }
}

/// All vectors of a job plus the shared feature layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureSet {
    pub names: Vec<String>,
    pub vectors: Vec<FeatureVector>,
    pub frequencies: FrequencyTable,
}

pub struct FeatureExtractor {
    grouping: Vec<GroupComponent>,
}

impl FeatureExtractor {
    pub fn new(grouping: Vec<GroupComponent>) -> Self {
        Self { grouping }
    }

    /// Turn the records of one job into feature vectors, in input order.
    pub fn extract(&self, records: &[Record]) -> Result<FeatureSet, ExtractError> {
        if self.grouping.is_empty() {
            return Err(ExtractError::EmptyGrouping);
        }

        // Layout: numeric fields seen anywhere in the job, then derived text features.
        let numeric_fields: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| {
                r.fields
                    .iter()
                    .filter(|(_, v)| v.as_f64().is_some())
                    .map(|(k, _)| k.as_str())
            })
            .collect();
        let has_status = records
            .iter()
            .any(|r| r.field("status").and_then(Scalar::as_f64).is_some());

        let mut names: Vec<String> = numeric_fields.iter().map(|s| s.to_string()).collect();
        names.push("text_len".to_string());
        names.extend(LEVEL_TOKENS.iter().map(|(name, _)| name.to_string()));
        if has_status {
            names.push("status_4xx".to_string());
            names.push("status_5xx".to_string());
        }

        let mut frequencies = FrequencyTable::default();
        let mut vectors = Vec::with_capacity(records.len());

        for record in records {
            let mut values = Vec::with_capacity(names.len());
            for field in &numeric_fields {
                values.push(record.field(field).and_then(Scalar::as_f64).unwrap_or(0.0));
            }
            values.push(record.raw_text.chars().count() as f64);
            for (_, token) in LEVEL_TOKENS {
                values.push(record.raw_text.matches(token).count() as f64);
            }
            if has_status {
                let status = record.field("status").and_then(Scalar::as_f64).unwrap_or(0.0);
                values.push(if (400.0..500.0).contains(&status) { 1.0 } else { 0.0 });
                values.push(if (500.0..600.0).contains(&status) { 1.0 } else { 0.0 });
            }

            let labels = record
                .fields
                .iter()
                .filter(|(_, v)| v.as_f64().is_none())
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();

            let category = self.category_key(record);
            let rolling_count = frequencies.record(&category);

            vectors.push(FeatureVector {
                record_id: record.id.clone(),
                timestamp: record.timestamp,
                category,
                values,
                labels,
                rolling_count,
            });
        }

        Ok(FeatureSet {
            names,
            vectors,
            frequencies,
        })
    }

    /// Grouping key of a record, components joined by `/`.
    pub fn category_key(&self, record: &Record) -> String {
        self.grouping
            .iter()
            .map(|component| match component {
                GroupComponent::Source => record.source_id.clone(),
                GroupComponent::Template => message_template(&record.raw_text),
                GroupComponent::Field(name) => {
                    record.field(name).map(|v| v.to_string()).unwrap_or_default()
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(0x)?[0-9a-f-]{12,}$").expect("static regex"))
}

/// Normalized message template: lowercase, identifiers and digit runs
/// collapsed to `#`, first few tokens only.
pub fn message_template(text: &str) -> String {
    text.split_whitespace()
        .take(TEMPLATE_TOKENS)
        .map(|token| {
            let lower = token.to_lowercase();
            if identifier_re().is_match(&lower) && lower.chars().any(|c| c.is_ascii_digit()) {
                "#".to_string()
            } else {
                digits_re().replace_all(&lower, "#").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(sec: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(sec)
    }

    fn sample() -> Vec<Record> {
        vec![
            Record::new("r1", ts(0), "api", "GET /health 200 in 12ms").with_field("status", 200i64),
            Record::new("r2", ts(1), "api", "ERROR upstream 503 from 10.0.0.7")
                .with_field("status", "503")
                .with_field("route", "/orders"),
            Record::new("r3", ts(2), "api", "GET /health 200 in 15ms")
                .with_field("status", 200i64)
                .with_field("response_time", 15.0),
        ]
    }

    #[test]
    fn test_template_collapses_numbers_and_ids() {
        assert_eq!(message_template("GET /health 200 in 12ms"), "get /health # in #ms");
        assert_eq!(
            message_template("job 3f2a9c1e-77aa-4c1b-9f00-aa11bb22cc33 failed"),
            "job # failed"
        );
        assert_eq!(
            message_template("a b c d e f g h i j"),
            "a b c d e f g h",
            "template keeps only the leading tokens"
        );
    }

    #[test]
    fn test_vectors_share_layout() {
        let set = FeatureExtractor::new(default_grouping()).extract(&sample()).unwrap();
        assert_eq!(
            set.names,
            vec![
                "response_time",
                "status",
                "text_len",
                "error_tokens",
                "warn_tokens",
                "fatal_tokens",
                "status_4xx",
                "status_5xx"
            ]
        );
        for v in &set.vectors {
            assert_eq!(v.values.len(), set.names.len());
        }
        // r2: no response_time, status parsed from text, one ERROR token, 5xx flag.
        let r2 = &set.vectors[1];
        assert_eq!(r2.values[0], 0.0);
        assert_eq!(r2.values[1], 503.0);
        assert_eq!(r2.values[3], 1.0);
        assert_eq!(r2.values[7], 1.0);
        assert_eq!(r2.labels.get("route").map(String::as_str), Some("/orders"));
    }

    #[test]
    fn test_rolling_counts_per_category() {
        let set = FeatureExtractor::new(default_grouping()).extract(&sample()).unwrap();
        assert_eq!(set.vectors[0].category, "api/get /health # in #ms");
        assert_eq!(set.vectors[0].rolling_count, 1);
        assert_eq!(set.vectors[1].rolling_count, 1);
        assert_eq!(set.vectors[2].rolling_count, 2);
        assert_eq!(set.frequencies.get("api/get /health # in #ms"), 2);
        assert_eq!(set.frequencies.category_count(), 2);
    }

    #[test]
    fn test_field_grouping() {
        let extractor = FeatureExtractor::new(vec![
            GroupComponent::Source,
            GroupComponent::Field("route".into()),
        ]);
        let set = extractor.extract(&sample()).unwrap();
        assert_eq!(set.vectors[0].category, "api/");
        assert_eq!(set.vectors[1].category, "api//orders");
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = FeatureExtractor::new(default_grouping());
        let a = extractor.extract(&sample()).unwrap();
        let b = extractor.extract(&sample()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_grouping_rejected() {
        let err = FeatureExtractor::new(vec![]).extract(&sample()).unwrap_err();
        assert!(matches!(err, ExtractError::EmptyGrouping));
    }

    #[test]
    fn test_group_component_parsing() {
        assert_eq!(
            GroupComponent::try_from("field:level".to_string()).unwrap(),
            GroupComponent::Field("level".into())
        );
        assert!(GroupComponent::try_from("field:".to_string()).is_err());
        assert!(GroupComponent::try_from("host".to_string()).is_err());
    }
}

//! Anomaly detectors and the severity aggregator.

pub mod aggregate;
pub mod forest;
pub mod pattern;
pub mod semantic;
pub mod series;
pub mod statistical;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("aggregation invariant violated: {0}")]
    AggregationInvariant(String),
}

/// The detectors a job can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    Statistical,
    Pattern,
    Semantic,
}

impl Detector {
    pub fn all() -> [Detector; 3] {
        [Detector::Statistical, Detector::Pattern, Detector::Semantic]
    }

    /// Candidate kinds this detector emits.
    pub fn kinds(self) -> &'static [DetectorKind] {
        match self {
            Detector::Statistical => &[DetectorKind::Outlier, DetectorKind::Burst],
            Detector::Pattern => &[DetectorKind::Pattern],
            Detector::Semantic => &[DetectorKind::Semantic],
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detector::Statistical => write!(f, "statistical"),
            Detector::Pattern => write!(f, "pattern"),
            Detector::Semantic => write!(f, "semantic"),
        }
    }
}

impl FromStr for Detector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "statistical" => Ok(Detector::Statistical),
            "pattern" => Ok(Detector::Pattern),
            "semantic" => Ok(Detector::Semantic),
            other => Err(format!("unknown detector '{}'", other)),
        }
    }
}

/// Which algorithm produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Outlier,
    Burst,
    Pattern,
    Semantic,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorKind::Outlier => write!(f, "outlier"),
            DetectorKind::Burst => write!(f, "burst"),
            DetectorKind::Pattern => write!(f, "pattern"),
            DetectorKind::Semantic => write!(f, "semantic"),
        }
    }
}

/// Detector sensitivity. Higher sensitivity means lower thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            other => Err(format!("sensitivity must be low, medium or high, got '{}'", other)),
        }
    }
}

/// A threshold per sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitivityTable {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl SensitivityTable {
    pub fn get(&self, sensitivity: Sensitivity) -> f64 {
        match sensitivity {
            Sensitivity::Low => self.low,
            Sensitivity::Medium => self.medium,
            Sensitivity::High => self.high,
        }
    }

    /// Thresholds must not increase with sensitivity.
    pub fn is_monotonic(&self) -> bool {
        self.low >= self.medium && self.medium >= self.high
    }
}

/// Severity tier of a finalized anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// A detector's raw finding about one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyCandidate {
    pub record_id: String,
    /// Other records the finding covers (e.g. every record of a burst window).
    #[serde(default)]
    pub related_records: Vec<String>,
    pub detector_kind: DetectorKind,
    /// Grouping key of `record_id`.
    pub category: String,
    pub raw_score: f64,
    pub evidence: serde_json::Value,
    pub rationale: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_detector_parse() {
        assert_eq!("pattern".parse::<Detector>().unwrap(), Detector::Pattern);
        assert!("magic".parse::<Detector>().is_err());
        assert_eq!(" HIGH ".parse::<Sensitivity>().unwrap(), Sensitivity::High);
    }

    #[test]
    fn test_sensitivity_table_monotonic() {
        let ok = SensitivityTable { low: 0.7, medium: 0.6, high: 0.5 };
        assert!(ok.is_monotonic());
        assert_eq!(ok.get(Sensitivity::High), 0.5);
        let bad = SensitivityTable { low: 0.5, medium: 0.6, high: 0.5 };
        assert!(!bad.is_monotonic());
    }
}

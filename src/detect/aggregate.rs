//! Severity aggregation: merge detector candidates into scored anomalies.
//!
//! Candidates about the same record and category share a fingerprint and
//! collapse into one anomaly. The output does not depend on the order the
//! candidates arrive in.

use crate::detect::{AnomalyCandidate, DetectError, DetectorKind, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Hex characters kept from the fingerprint digest.
const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    /// Added per additional distinct detector kind in a group.
    pub corroboration_bonus: f64,
    /// Burst z-score that normalizes to 1.0.
    pub burst_z_ceiling: f64,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            critical: 0.85,
            high: 0.65,
            medium: 0.4,
            corroboration_bonus: 0.1,
            burst_z_ceiling: 6.0,
        }
    }
}

impl SeverityPolicy {
    pub fn tier(&self, score: f64) -> Severity {
        if score >= self.critical {
            Severity::Critical
        } else if score >= self.high {
            Severity::High
        } else if score >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Map a raw detector score onto `[0, 1]`.
    pub fn normalize(&self, kind: DetectorKind, raw: f64) -> f64 {
        match kind {
            DetectorKind::Burst => (raw / self.burst_z_ceiling).clamp(0.0, 1.0),
            DetectorKind::Outlier | DetectorKind::Pattern | DetectorKind::Semantic => raw.clamp(0.0, 1.0),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let ordered = 1.0 >= self.critical
            && self.critical >= self.high
            && self.high >= self.medium
            && self.medium >= 0.0;
        if !ordered {
            return Err(format!(
                "severity thresholds must satisfy 1 >= critical >= high >= medium >= 0 (got {}/{}/{})",
                self.critical, self.high, self.medium
            ));
        }
        if !(0.0..=1.0).contains(&self.corroboration_bonus) {
            return Err(format!("corroboration_bonus {} is outside [0, 1]", self.corroboration_bonus));
        }
        if !(self.burst_z_ceiling > 0.0 && self.burst_z_ceiling.is_finite()) {
            return Err(format!("burst_z_ceiling must be positive, got {}", self.burst_z_ceiling));
        }
        Ok(())
    }
}

/// A finalized, deduplicated finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub fingerprint: String,
    pub record_ids: Vec<String>,
    pub category: String,
    pub severity: Severity,
    pub combined_score: f64,
    pub contributing_detectors: BTreeSet<DetectorKind>,
    pub rationale: String,
    /// Strongest candidate's evidence per detector kind.
    pub evidence: BTreeMap<DetectorKind, Value>,
}

/// Stable identity of a finding: digest of record id and category key.
pub fn fingerprint(record_id: &str, category: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(category.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

struct Scored {
    candidate: AnomalyCandidate,
    normalized: f64,
    evidence_key: String,
}

/// Total order: strongest first, ties broken on content only.
fn rank(a: &Scored, b: &Scored) -> Ordering {
    b.normalized
        .total_cmp(&a.normalized)
        .then_with(|| a.candidate.detector_kind.cmp(&b.candidate.detector_kind))
        .then_with(|| a.candidate.rationale.cmp(&b.candidate.rationale))
        .then_with(|| a.evidence_key.cmp(&b.evidence_key))
}

pub struct SeverityAggregator<'a> {
    policy: &'a SeverityPolicy,
}

impl<'a> SeverityAggregator<'a> {
    pub fn new(policy: &'a SeverityPolicy) -> Self {
        Self { policy }
    }

    pub fn aggregate(&self, candidates: Vec<AnomalyCandidate>) -> Result<Vec<Anomaly>, DetectError> {
        let total = candidates.len();
        let mut groups: BTreeMap<String, Vec<Scored>> = BTreeMap::new();

        for candidate in candidates {
            if !candidate.raw_score.is_finite() {
                return Err(DetectError::AggregationInvariant(format!(
                    "non-finite {} score for record {}",
                    candidate.detector_kind, candidate.record_id
                )));
            }
            let normalized = self.policy.normalize(candidate.detector_kind, candidate.raw_score);
            let evidence_key = candidate.evidence.to_string();
            groups
                .entry(fingerprint(&candidate.record_id, &candidate.category))
                .or_default()
                .push(Scored {
                    candidate,
                    normalized,
                    evidence_key,
                });
        }

        let mut anomalies = Vec::with_capacity(groups.len());
        for (fp, mut members) in groups {
            members.sort_by(rank);
            anomalies.push(self.merge(fp, &members)?);
        }

        anomalies.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.combined_score.total_cmp(&a.combined_score))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });

        info!(candidates = total, anomalies = anomalies.len(), "aggregation complete");
        Ok(anomalies)
    }

    /// `members` is non-empty and already ranked.
    fn merge(&self, fingerprint: String, members: &[Scored]) -> Result<Anomaly, DetectError> {
        let lead = &members[0].candidate;
        if let Some(other) = members
            .iter()
            .map(|m| &m.candidate)
            .find(|c| c.record_id != lead.record_id || c.category != lead.category)
        {
            return Err(DetectError::AggregationInvariant(format!(
                "fingerprint {} collides for ({}, {}) and ({}, {})",
                fingerprint, lead.record_id, lead.category, other.record_id, other.category
            )));
        }

        let mut record_ids = BTreeSet::new();
        let mut kinds = BTreeSet::new();
        let mut evidence = BTreeMap::new();
        for member in members {
            let c = &member.candidate;
            record_ids.insert(c.record_id.clone());
            record_ids.extend(c.related_records.iter().cloned());
            kinds.insert(c.detector_kind);
            // Ranked order: the first seen per kind is the strongest.
            evidence.entry(c.detector_kind).or_insert_with(|| c.evidence.clone());
        }

        let best = members[0].normalized;
        let bonus = self.policy.corroboration_bonus * (kinds.len() as f64 - 1.0);
        let combined_score = (best + bonus).min(1.0);
        if !combined_score.is_finite() {
            return Err(DetectError::AggregationInvariant(format!(
                "non-finite combined score for {}",
                fingerprint
            )));
        }

        let rationale = rationale_for(members, &kinds);
        debug!(%fingerprint, combined_score, detectors = kinds.len(), "merged candidates");

        Ok(Anomaly {
            fingerprint,
            record_ids: record_ids.into_iter().collect(),
            category: lead.category.clone(),
            severity: self.policy.tier(combined_score),
            combined_score,
            contributing_detectors: kinds,
            rationale,
            evidence,
        })
    }
}

fn rationale_for(members: &[Scored], kinds: &BTreeSet<DetectorKind>) -> String {
    let semantic = members
        .iter()
        .filter(|m| m.candidate.detector_kind == DetectorKind::Semantic)
        .find_map(|m| m.candidate.rationale.as_deref().filter(|r| !r.trim().is_empty()));

    let lead = &members[0].candidate;
    let mut text = match semantic {
        Some(r) => r.trim().to_string(),
        None => describe(lead),
    };

    if kinds.len() > 1 {
        let others: Vec<String> = kinds
            .iter()
            .filter(|k| **k != lead.detector_kind)
            .map(|k| k.to_string())
            .collect();
        text.push_str(&format!(" (corroborated by {})", others.join(", ")));
    }
    text
}

fn describe(c: &AnomalyCandidate) -> String {
    let num = |key: &str| c.evidence.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    match c.detector_kind {
        DetectorKind::Outlier => format!(
            "Record {} is a statistical outlier (isolation score {:.3}, threshold {:.2})",
            c.record_id,
            num("isolation_score"),
            num("threshold")
        ),
        DetectorKind::Burst => format!(
            "Burst of {} records in '{}' within a {}s window (z-score {:.1} against baseline mean {:.1})",
            num("window_count"),
            c.category,
            num("window_secs"),
            num("z_score"),
            num("baseline_mean")
        ),
        DetectorKind::Pattern => format!(
            "Record {} matches known signature '{}' ({})",
            c.record_id,
            c.evidence.get("signature_name").and_then(Value::as_str).unwrap_or("unknown"),
            c.evidence.get("signature_category").and_then(Value::as_str).unwrap_or("uncategorized")
        ),
        DetectorKind::Semantic => format!(
            "Record {} flagged by semantic analysis (confidence {:.2})",
            c.record_id, c.raw_score
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(record: &str, kind: DetectorKind, score: f64) -> AnomalyCandidate {
        AnomalyCandidate {
            record_id: record.to_string(),
            related_records: Vec::new(),
            detector_kind: kind,
            category: "api/request failed".to_string(),
            raw_score: score,
            evidence: json!({ "score": score }),
            rationale: None,
        }
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = fingerprint("r1", "api/x");
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint("r1", "api/x"));
        assert_ne!(fp, fingerprint("r1", "api/y"));
        // The separator keeps the two parts from running together.
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
    }

    #[test]
    fn test_tiers() {
        let policy = SeverityPolicy::default();
        assert_eq!(policy.tier(0.9), Severity::Critical);
        assert_eq!(policy.tier(0.85), Severity::Critical);
        assert_eq!(policy.tier(0.7), Severity::High);
        assert_eq!(policy.tier(0.4), Severity::Medium);
        assert_eq!(policy.tier(0.39), Severity::Low);
    }

    #[test]
    fn test_burst_normalization() {
        let policy = SeverityPolicy::default();
        assert_eq!(policy.normalize(DetectorKind::Burst, 3.0), 0.5);
        assert_eq!(policy.normalize(DetectorKind::Burst, 48.0), 1.0);
        assert_eq!(policy.normalize(DetectorKind::Pattern, 1.7), 1.0);
    }

    #[test]
    fn test_corroboration_merges_and_boosts() {
        let policy = SeverityPolicy::default();
        let out = SeverityAggregator::new(&policy)
            .aggregate(vec![
                candidate("r1", DetectorKind::Pattern, 0.6),
                candidate("r1", DetectorKind::Outlier, 0.7),
            ])
            .unwrap();
        assert_eq!(out.len(), 1);
        let a = &out[0];
        assert!((a.combined_score - 0.8).abs() < 1e-9);
        assert_eq!(a.severity, Severity::High);
        assert_eq!(a.contributing_detectors.len(), 2);
        assert!(a.rationale.contains("corroborated by pattern"));
    }

    #[test]
    fn test_semantic_rationale_preferred() {
        let policy = SeverityPolicy::default();
        let mut semantic = candidate("r1", DetectorKind::Semantic, 0.5);
        semantic.rationale = Some("Unusual shutdown sequence".to_string());
        let out = SeverityAggregator::new(&policy)
            .aggregate(vec![candidate("r1", DetectorKind::Pattern, 0.9), semantic])
            .unwrap();
        assert!(out[0].rationale.starts_with("Unusual shutdown sequence"));
    }

    #[test]
    fn test_burst_related_records_joined() {
        let policy = SeverityPolicy::default();
        let mut burst = candidate("r1", DetectorKind::Burst, 12.0);
        burst.related_records = vec!["r3".to_string(), "r2".to_string()];
        let out = SeverityAggregator::new(&policy).aggregate(vec![burst]).unwrap();
        assert_eq!(out[0].record_ids, vec!["r1", "r2", "r3"]);
        assert_eq!(out[0].severity, Severity::Critical);
    }

    #[test]
    fn test_non_finite_rejected() {
        let policy = SeverityPolicy::default();
        let err = SeverityAggregator::new(&policy)
            .aggregate(vec![candidate("r1", DetectorKind::Outlier, f64::NAN)])
            .unwrap_err();
        assert!(matches!(err, DetectError::AggregationInvariant(_)));
    }

    #[test]
    fn test_output_sorted() {
        let policy = SeverityPolicy::default();
        let out = SeverityAggregator::new(&policy)
            .aggregate(vec![
                candidate("a", DetectorKind::Pattern, 0.3),
                candidate("b", DetectorKind::Pattern, 0.95),
                candidate("c", DetectorKind::Pattern, 0.7),
            ])
            .unwrap();
        let scores: Vec<f64> = out.iter().map(|a| a.combined_score).collect();
        assert_eq!(scores, vec![0.95, 0.7, 0.3]);
    }

    #[test]
    fn test_policy_validation() {
        assert!(SeverityPolicy::default().validate().is_ok());
        let unordered = SeverityPolicy {
            high: 0.9,
            ..SeverityPolicy::default()
        };
        assert!(unordered.validate().is_err());
    }
}

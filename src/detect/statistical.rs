//! Statistical detector: isolation-forest outliers and per-category bursts.

use crate::detect::forest::{ForestParams, IsolationForest};
use crate::detect::series::TimeSeries;
use crate::detect::{AnomalyCandidate, DetectError, DetectorKind, Sensitivity, SensitivityTable};
use crate::features::FeatureSet;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalParams {
    pub forest: ForestParams,
    /// Isolation score a vector must exceed to be reported.
    pub outlier_thresholds: SensitivityTable,
    /// Z-score a window must reach to be reported as a burst.
    pub z_thresholds: SensitivityTable,
    pub window_secs: u64,
    /// Trailing windows used as the burst baseline.
    pub baseline_windows: usize,
    /// Windows that must precede a window before it is scored.
    pub baseline_windows_min: usize,
    pub min_stddev: f64,
    pub min_burst_count: u64,
}

impl Default for StatisticalParams {
    fn default() -> Self {
        Self {
            forest: ForestParams::default(),
            outlier_thresholds: SensitivityTable {
                low: 0.70,
                medium: 0.62,
                high: 0.55,
            },
            z_thresholds: SensitivityTable {
                low: 4.0,
                medium: 3.0,
                high: 2.5,
            },
            window_secs: 60,
            baseline_windows: 10,
            baseline_windows_min: 3,
            min_stddev: 1.0,
            min_burst_count: 5,
        }
    }
}

/// Candidates of one statistical pass. `outlier_error` is set when the
/// outlier model could not run and only burst detection contributed.
#[derive(Debug)]
pub struct StatisticalOutcome {
    pub candidates: Vec<AnomalyCandidate>,
    pub outlier_error: Option<DetectError>,
}

pub struct StatisticalDetector<'a> {
    params: &'a StatisticalParams,
    sensitivity: Sensitivity,
}

impl<'a> StatisticalDetector<'a> {
    pub fn new(params: &'a StatisticalParams, sensitivity: Sensitivity) -> Self {
        Self {
            params,
            sensitivity,
        }
    }

    pub fn detect(&self, features: &FeatureSet) -> StatisticalOutcome {
        let mut candidates = Vec::new();

        let outlier_error = match self.score_outliers(features) {
            Ok(found) => {
                candidates.extend(found);
                None
            }
            Err(e) => {
                warn!(error = %e, "outlier model skipped, running frequency detection only");
                Some(e)
            }
        };

        candidates.extend(self.detect_bursts(features));
        StatisticalOutcome {
            candidates,
            outlier_error,
        }
    }

    /// Fit a forest on the job's vectors and report those above threshold.
    pub fn score_outliers(&self, features: &FeatureSet) -> Result<Vec<AnomalyCandidate>, DetectError> {
        let rows: Vec<&[f64]> = features.vectors.iter().map(|v| v.values.as_slice()).collect();
        let forest = IsolationForest::fit(&rows, &self.params.forest)?;
        let threshold = self.params.outlier_thresholds.get(self.sensitivity);

        let mut found = Vec::new();
        for vector in &features.vectors {
            let score = forest.score(&vector.values);
            if score > threshold {
                found.push(AnomalyCandidate {
                    record_id: vector.record_id.clone(),
                    related_records: Vec::new(),
                    detector_kind: DetectorKind::Outlier,
                    category: vector.category.clone(),
                    raw_score: score,
                    evidence: serde_json::json!({
                        "isolation_score": score,
                        "threshold": threshold,
                    }),
                    rationale: None,
                });
            }
        }
        info!(vectors = features.vectors.len(), outliers = found.len(), threshold, "outlier scoring complete");
        Ok(found)
    }

    /// Per-category windowed counts scored against a trailing baseline.
    pub fn detect_bursts(&self, features: &FeatureSet) -> Vec<AnomalyCandidate> {
        let Ok(window) = i64::try_from(self.params.window_secs.max(1)) else {
            warn!(window_secs = self.params.window_secs, "burst window too wide, skipping burst detection");
            return Vec::new();
        };
        let Some(first_window) = features
            .vectors
            .iter()
            .map(|v| v.timestamp.timestamp().div_euclid(window))
            .min()
        else {
            return Vec::new();
        };

        // category -> window index -> positions of its records
        let mut buckets: BTreeMap<&str, BTreeMap<i64, Vec<usize>>> = BTreeMap::new();
        for (pos, vector) in features.vectors.iter().enumerate() {
            let idx = vector.timestamp.timestamp().div_euclid(window);
            buckets
                .entry(vector.category.as_str())
                .or_default()
                .entry(idx)
                .or_default()
                .push(pos);
        }

        let threshold = self.params.z_thresholds.get(self.sensitivity);
        let mut found = Vec::new();

        for (category, windows) in &buckets {
            for (&idx, members) in windows {
                let count = members.len() as u64;
                if count < self.params.min_burst_count {
                    continue;
                }
                let preceding = (idx - first_window) as usize;
                if preceding < self.params.baseline_windows_min {
                    continue;
                }
                let span = preceding.min(self.params.baseline_windows.max(1)) as i64;
                let baseline: Vec<f64> = ((idx - span)..idx)
                    .map(|w| windows.get(&w).map_or(0.0, |m| m.len() as f64))
                    .collect();
                let series = TimeSeries::new(baseline);
                let z = match series.z_score(count as f64, self.params.min_stddev, self.params.baseline_windows_min) {
                    Ok(z) => z,
                    Err(e) => {
                        debug!(category, window = idx, error = %e, "burst window skipped");
                        continue;
                    }
                };
                if z < threshold {
                    continue;
                }

                let anchor = &features.vectors[members[0]];
                let window_start = Utc
                    .timestamp_opt(idx * window, 0)
                    .single()
                    .unwrap_or(anchor.timestamp);
                found.push(AnomalyCandidate {
                    record_id: anchor.record_id.clone(),
                    related_records: members
                        .iter()
                        .skip(1)
                        .map(|&p| features.vectors[p].record_id.clone())
                        .collect(),
                    detector_kind: DetectorKind::Burst,
                    category: (*category).to_string(),
                    raw_score: z,
                    evidence: serde_json::json!({
                        "window_start": window_start.to_rfc3339(),
                        "window_secs": window,
                        "window_count": count,
                        "baseline_windows": span,
                        "baseline_mean": series.mean(),
                        "baseline_stddev": series.std_dev(),
                        "z_score": z,
                    }),
                    rationale: None,
                });
            }
        }

        info!(categories = buckets.len(), bursts = found.len(), threshold, "burst detection complete");
        found
    }
}

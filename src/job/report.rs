//! Job summary and recommendations.
//!
//! When the job used a working LLM provider the report is written by the
//! model; otherwise (or when that call fails) a templated report is built
//! from the anomaly tallies, so every finalized job carries one.

use crate::detect::aggregate::Anomaly;
use crate::detect::{DetectorKind, Severity};
use crate::llm::{LlmProvider, Prompt, ProviderError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const HEALTHY: &str = "No anomalies detected. System appears healthy.";
const GENERIC: &str = "Review detected anomalies and take appropriate action.";
const MAX_RECOMMENDATIONS: usize = 5;

const SYSTEM_PROMPT: &str = "You write the closing report of a log analysis job. \
Give a concise professional summary highlighting key findings and overall system health, \
and 3-5 specific, actionable recommendations for addressing the anomalies.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSource {
    Provider,
    Template,
}

impl fmt::Display for ReportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportSource::Provider => write!(f, "provider"),
            ReportSource::Template => write!(f, "template"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub summary: String,
    pub recommendations: Vec<String>,
    pub source: ReportSource,
}

#[derive(Deserialize)]
struct Reply {
    summary: String,
    #[serde(default)]
    recommendations: Vec<String>,
}

pub struct Reporter {
    provider: Option<Arc<dyn LlmProvider>>,
    call_timeout: Duration,
}

impl Reporter {
    /// `provider` is `None` when the report must be templated.
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, call_timeout_secs: u64) -> Self {
        Self {
            provider,
            call_timeout: Duration::from_secs(call_timeout_secs.max(1)),
        }
    }

    /// Build the report. A provider failure falls back to the template and is returned alongside.
    pub async fn generate(
        &self,
        records: usize,
        anomalies: &[Anomaly],
        degraded: &BTreeSet<DetectorKind>,
        cancel: &CancellationToken,
    ) -> (JobReport, Option<ProviderError>) {
        let Some(provider) = &self.provider else {
            return (template(records, anomalies, degraded), None);
        };

        let prompt = Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user: format!(
                "Analyzed {} records and found {} anomalies.\n\n{}",
                records,
                anomalies.len(),
                breakdown(anomalies)
            ),
        };
        let schema = response_schema();
        let call = tokio::time::timeout(self.call_timeout, provider.complete(&prompt, &schema));
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("report skipped after cancellation");
                return (template(records, anomalies, degraded), None);
            }
            r = call => match r {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            },
        };

        match result.and_then(parse_reply) {
            Ok((summary, mut recommendations)) => {
                if anomalies.is_empty() {
                    recommendations = vec![HEALTHY.to_string()];
                } else if recommendations.is_empty() {
                    recommendations = vec![GENERIC.to_string()];
                }
                let report = JobReport {
                    summary,
                    recommendations,
                    source: ReportSource::Provider,
                };
                (report, None)
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "report generation failed, using template");
                (template(records, anomalies, degraded), Some(e))
            }
        }
    }
}

fn parse_reply(value: Value) -> Result<(String, Vec<String>), ProviderError> {
    let reply: Reply = serde_json::from_value(value)
        .map_err(|e| ProviderError::InvalidResponse(format!("unexpected report shape: {}", e)))?;
    let summary = reply.summary.trim().to_string();
    if summary.is_empty() {
        return Err(ProviderError::InvalidResponse("empty summary".to_string()));
    }
    let recommendations = reply
        .recommendations
        .iter()
        .map(|r| r.trim().trim_start_matches(['-', '*', '•']).trim().to_string())
        .filter(|r| !r.is_empty())
        .take(MAX_RECOMMENDATIONS)
        .collect();
    Ok((summary, recommendations))
}

/// Severity and category tallies, worst severity first.
pub fn breakdown(anomalies: &[Anomaly]) -> String {
    if anomalies.is_empty() {
        return "No anomalies.".to_string();
    }
    let mut by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    for a in anomalies {
        *by_severity.entry(a.severity).or_insert(0) += 1;
        *by_category.entry(a.category.as_str()).or_insert(0) += 1;
    }
    let severities: Vec<String> = by_severity.iter().rev().map(|(s, n)| format!("{} {}", s, n)).collect();
    let mut categories: Vec<(&str, usize)> = by_category.into_iter().collect();
    categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let categories: Vec<String> = categories.iter().map(|(c, n)| format!("'{}' {}", c, n)).collect();
    format!("By severity: {}.\nBy category: {}.", severities.join(", "), categories.join(", "))
}

/// Deterministic report used without a provider.
pub fn template(records: usize, anomalies: &[Anomaly], degraded: &BTreeSet<DetectorKind>) -> JobReport {
    let mut summary = format!(
        "Analysis completed: {} anomalies detected in {} records.",
        anomalies.len(),
        records
    );
    if !anomalies.is_empty() {
        summary.push(' ');
        summary.push_str(&breakdown(anomalies).replace('\n', " "));
    }
    if !degraded.is_empty() {
        let names: Vec<String> = degraded.iter().map(|d| d.to_string()).collect();
        summary.push_str(&format!(" Degraded detectors: {}.", names.join(", ")));
    }

    JobReport {
        summary,
        recommendations: recommend(anomalies),
        source: ReportSource::Template,
    }
}

fn recommend(anomalies: &[Anomaly]) -> Vec<String> {
    if anomalies.is_empty() {
        return vec![HEALTHY.to_string()];
    }

    // category -> (count, worst anomaly); input is already worst-first
    let mut groups: BTreeMap<&str, (usize, &Anomaly)> = BTreeMap::new();
    for a in anomalies {
        groups.entry(a.category.as_str()).or_insert((0, a)).0 += 1;
    }
    let mut ranked: Vec<(&str, usize, &Anomaly)> = groups.into_iter().map(|(c, (n, a))| (c, n, a)).collect();
    ranked.sort_by(|a, b| {
        b.2.severity
            .cmp(&a.2.severity)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.0.cmp(b.0))
    });

    ranked
        .into_iter()
        .take(MAX_RECOMMENDATIONS)
        .map(|(category, count, worst)| {
            let tally = format!("{} anomal{}, worst {}", count, if count == 1 { "y" } else { "ies" }, worst.severity);
            let kind = worst
                .contributing_detectors
                .iter()
                .find(|k| **k != DetectorKind::Semantic)
                .or_else(|| worst.contributing_detectors.iter().next());
            match kind {
                Some(DetectorKind::Burst) => {
                    format!("Investigate what triggered the burst of '{}' events ({}).", category, tally)
                }
                Some(DetectorKind::Outlier) => {
                    format!("Compare the outlying '{}' records against their normal baseline ({}).", category, tally)
                }
                Some(DetectorKind::Pattern) => {
                    format!("Address the known failure signature seen in '{}' ({}).", category, tally)
                }
                Some(DetectorKind::Semantic) | None => {
                    format!("Review the '{}' records flagged by semantic analysis ({}).", category, tally)
                }
            }
        })
        .collect()
}

fn response_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary", "recommendations"],
        "properties": {
            "summary": { "type": "string" },
            "recommendations": { "type": "array", "items": { "type": "string" } }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn anomaly(fp: &str, category: &str, severity: Severity, kinds: &[DetectorKind]) -> Anomaly {
        Anomaly {
            fingerprint: fp.to_string(),
            record_ids: vec![fp.to_string()],
            category: category.to_string(),
            severity,
            combined_score: 0.9,
            contributing_detectors: kinds.iter().copied().collect(),
            rationale: String::new(),
            evidence: BTreeMap::new(),
        }
    }

    struct Canned(Result<Value, fn() -> ProviderError>);

    #[async_trait]
    impl LlmProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _prompt: &Prompt, _schema: &Value) -> Result<Value, ProviderError> {
            match &self.0 {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(e()),
            }
        }
    }

    fn sample() -> Vec<Anomaly> {
        vec![
            anomaly("a", "db/connection refused", Severity::Critical, &[DetectorKind::Burst, DetectorKind::Pattern]),
            anomaly("b", "db/connection refused", Severity::High, &[DetectorKind::Pattern]),
            anomaly("c", "api/latency", Severity::Medium, &[DetectorKind::Outlier]),
        ]
    }

    #[test]
    fn test_template_without_anomalies() {
        let report = template(42, &[], &BTreeSet::new());
        assert_eq!(report.summary, "Analysis completed: 0 anomalies detected in 42 records.");
        assert_eq!(report.recommendations, vec![HEALTHY.to_string()]);
        assert_eq!(report.source, ReportSource::Template);
    }

    #[test]
    fn test_template_ranks_categories() {
        let degraded: BTreeSet<DetectorKind> = [DetectorKind::Semantic].into_iter().collect();
        let report = template(1000, &sample(), &degraded);
        assert!(report.summary.contains("3 anomalies detected in 1000 records"));
        assert!(report.summary.contains("critical 1, high 1, medium 1"));
        assert!(report.summary.ends_with("Degraded detectors: semantic."));
        assert_eq!(report.recommendations.len(), 2);
        assert!(report.recommendations[0].starts_with("Investigate what triggered the burst of 'db/connection refused'"));
        assert!(report.recommendations[0].contains("2 anomalies, worst critical"));
        assert!(report.recommendations[1].contains("'api/latency'"));
        assert_eq!(template(1000, &sample(), &degraded), report);
    }

    #[tokio::test]
    async fn test_provider_report() {
        let provider = Arc::new(Canned(Ok(json!({
            "summary": "  Database connectivity failed repeatedly. ",
            "recommendations": ["- Check db-primary health", "", "* Add connection retries"]
        }))));
        let (report, err) = Reporter::new(Some(provider), 5)
            .generate(100, &sample(), &BTreeSet::new(), &CancellationToken::new())
            .await;
        assert!(err.is_none());
        assert_eq!(report.source, ReportSource::Provider);
        assert_eq!(report.summary, "Database connectivity failed repeatedly.");
        assert_eq!(report.recommendations, vec!["Check db-primary health", "Add connection retries"]);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back() {
        let provider = Arc::new(Canned(Err(|| ProviderError::Unavailable("502".into()))));
        let (report, err) = Reporter::new(Some(provider), 5)
            .generate(100, &sample(), &BTreeSet::new(), &CancellationToken::new())
            .await;
        assert!(matches!(err, Some(ProviderError::Unavailable(_))));
        assert_eq!(report, template(100, &sample(), &BTreeSet::new()));
    }

    #[tokio::test]
    async fn test_malformed_reply_falls_back() {
        let provider = Arc::new(Canned(Ok(json!({ "summary": "   " }))));
        let (report, err) = Reporter::new(Some(provider), 5)
            .generate(3, &[], &BTreeSet::new(), &CancellationToken::new())
            .await;
        assert!(matches!(err, Some(ProviderError::InvalidResponse(_))));
        assert_eq!(report.source, ReportSource::Template);
        assert_eq!(report.recommendations, vec![HEALTHY.to_string()]);
    }
}

//! LLM-backed semantic analysis of record batches.

use crate::detect::{AnomalyCandidate, DetectorKind};
use crate::features::FeatureSet;
use crate::llm::retry::RetryPolicy;
use crate::llm::{LlmProvider, Prompt, ProviderError};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You review batches of log and telemetry records. \
Flag records that look anomalous: failures, unusual sequences, suspicious activity, \
or values inconsistent with the rest of the batch. Only use record ids that appear \
in the batch. Give a confidence between 0 and 1 and a one-sentence rationale for each.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticParams {
    /// Characters of `raw_text` sent per record.
    pub excerpt_chars: usize,
    pub call_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for SemanticParams {
    fn default() -> Self {
        Self {
            excerpt_chars: 500,
            call_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// A batch the provider could not analyze.
#[derive(Debug)]
pub struct BatchFailure {
    pub batch: usize,
    pub error: ProviderError,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct SemanticOutcome {
    pub candidates: Vec<AnomalyCandidate>,
    pub batches_total: usize,
    pub batches_ok: usize,
    pub failures: Vec<BatchFailure>,
    /// An authentication failure stopped the remaining batches.
    pub aborted: bool,
    pub cancelled: bool,
}

#[derive(Deserialize)]
struct Finding {
    record_id: String,
    #[serde(default)]
    category: Option<String>,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

#[derive(Deserialize)]
struct Findings {
    anomalies: Vec<Finding>,
}

pub struct SemanticAnalyzer {
    provider: Arc<dyn LlmProvider>,
    batch_size: usize,
    params: SemanticParams,
}

impl SemanticAnalyzer {
    pub fn new(provider: Arc<dyn LlmProvider>, batch_size: usize, params: SemanticParams) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            params,
        }
    }

    pub async fn analyze(&self, records: &[Record], features: &FeatureSet, cancel: &CancellationToken) -> SemanticOutcome {
        let schema = response_schema();
        let call_timeout = Duration::from_secs(self.params.call_timeout_secs.max(1));
        let mut outcome = SemanticOutcome {
            batches_total: records.len().div_ceil(self.batch_size),
            ..SemanticOutcome::default()
        };

        let batches = records.chunks(self.batch_size).zip(features.vectors.chunks(self.batch_size));
        for (batch, (chunk, vectors)) in batches.enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let prompt = self.prompt_for(chunk);
            let provider = &self.provider;
            let (prompt_ref, schema_ref) = (&prompt, &schema);
            let attempted = self
                .params
                .retry
                .run(cancel, || async move {
                    match tokio::time::timeout(call_timeout, provider.complete(prompt_ref, schema_ref)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout),
                    }
                })
                .await;

            if cancel.is_cancelled() {
                debug!(batch, "discarding batch result after cancellation");
                outcome.cancelled = true;
                break;
            }

            let categories: HashMap<&str, &str> = chunk
                .iter()
                .zip(vectors)
                .map(|(r, v)| (r.id.as_str(), v.category.as_str()))
                .collect();

            match attempted.result.and_then(|value| self.parse(batch, value, &categories)) {
                Ok(found) => {
                    debug!(batch, flagged = found.len(), attempts = attempted.attempts, "batch analyzed");
                    outcome.batches_ok += 1;
                    outcome.candidates.extend(found);
                }
                Err(error) => {
                    let auth = matches!(error, ProviderError::AuthError(_));
                    warn!(batch, attempts = attempted.attempts, error = %error, "semantic batch skipped");
                    outcome.failures.push(BatchFailure {
                        batch,
                        error,
                        attempts: attempted.attempts,
                    });
                    if auth {
                        outcome.aborted = true;
                        break;
                    }
                }
            }
        }

        info!(
            provider = self.provider.name(),
            batches = outcome.batches_total,
            ok = outcome.batches_ok,
            failed = outcome.failures.len(),
            flagged = outcome.candidates.len(),
            "semantic analysis complete"
        );
        outcome
    }

    fn prompt_for(&self, chunk: &[Record]) -> Prompt {
        let lines: Vec<String> = chunk
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "timestamp": r.timestamp.to_rfc3339(),
                    "source": r.source_id,
                    "excerpt": excerpt(&r.raw_text, self.params.excerpt_chars),
                })
                .to_string()
            })
            .collect();
        Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user: format!("Records ({}):\n{}", chunk.len(), lines.join("\n")),
        }
    }

    fn parse(&self, batch: usize, value: Value, categories: &HashMap<&str, &str>) -> Result<Vec<AnomalyCandidate>, ProviderError> {
        let findings: Findings = serde_json::from_value(value)
            .map_err(|e| ProviderError::InvalidResponse(format!("unexpected response shape: {}", e)))?;

        let mut found = Vec::new();
        for finding in findings.anomalies {
            let Some(category) = categories.get(finding.record_id.as_str()) else {
                debug!(batch, record_id = %finding.record_id, "dropping finding outside the batch");
                continue;
            };
            let confidence = if finding.confidence.is_finite() {
                finding.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            found.push(AnomalyCandidate {
                record_id: finding.record_id,
                related_records: Vec::new(),
                detector_kind: DetectorKind::Semantic,
                category: (*category).to_string(),
                raw_score: confidence,
                evidence: json!({
                    "confidence": confidence,
                    "batch": batch,
                    "provider": self.provider.name(),
                    "model_category": finding.category,
                }),
                rationale: Some(finding.rationale),
            });
        }
        Ok(found)
    }
}

fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn response_schema() -> Value {
    json!({
        "type": "object",
        "required": ["anomalies"],
        "properties": {
            "anomalies": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["record_id", "confidence", "rationale"],
                    "properties": {
                        "record_id": { "type": "string" },
                        "category": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "rationale": { "type": "string" }
                    }
                }
            }
        }
    })
}

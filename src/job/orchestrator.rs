//! Runs one analysis job end to end.
//!
//! acquire -> canonical order -> extract -> detectors (concurrently) ->
//! aggregate -> persist. Cancellation is observed between stages and at
//! semantic batch boundaries.

use super::report::Reporter;
use super::{AnalysisJob, JobError, JobHandle, JobMetrics, JobState, Stage};
use crate::config::DetectorConfig;
use crate::detect::aggregate::{Anomaly, SeverityAggregator};
use crate::detect::pattern::{PatternDetector, SignatureLibrary};
use crate::detect::semantic::{SemanticAnalyzer, SemanticOutcome};
use crate::detect::statistical::{StatisticalDetector, StatisticalOutcome};
use crate::detect::{AnomalyCandidate, Detector, DetectorKind};
use crate::features::FeatureExtractor;
use crate::llm::LlmProvider;
use crate::record::{canonical_order, Record, TimeRange};
use crate::sources::{ConnectorError, DataSourceRef, SourceRegistry};
use crate::storage::Persistence;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// What each detector task returned; `None` when the detector was not selected.
struct DetectorResults {
    statistical: Option<Result<StatisticalOutcome, JoinError>>,
    pattern: Option<Result<Vec<AnomalyCandidate>, JoinError>>,
    /// `Some(None)`: selected without a provider.
    semantic: Option<Option<Result<SemanticOutcome, JoinError>>>,
}

/// A finished job and its anomalies. `failure` is set when the job ended `failed`.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: AnalysisJob,
    pub anomalies: Vec<Anomaly>,
    pub failure: Option<JobError>,
}

#[derive(Clone)]
pub struct Orchestrator {
    sources: Arc<SourceRegistry>,
    signatures: Arc<SignatureLibrary>,
    provider: Option<Arc<dyn LlmProvider>>,
    store: Arc<dyn Persistence>,
}

impl Orchestrator {
    pub fn new(
        sources: Arc<SourceRegistry>,
        signatures: Arc<SignatureLibrary>,
        provider: Option<Arc<dyn LlmProvider>>,
        store: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            sources,
            signatures,
            provider,
            store,
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Create a pending job and the handle used to observe or cancel it.
    pub fn prepare(&self, source: DataSourceRef, range: Option<TimeRange>, config: DetectorConfig) -> (AnalysisJob, JobHandle) {
        let job = AnalysisJob::new(source, range, config);
        let handle = JobHandle::new(job.id);
        (job, handle)
    }

    /// Run `job` to a terminal state.
    ///
    /// Failed and cancelled jobs are still `Ok`; `Err` means the result could
    /// not be persisted (the handle then stays `running`) or an internal bug.
    pub async fn run(&self, mut job: AnalysisJob, handle: &JobHandle) -> Result<JobOutcome, JobError> {
        let started = Instant::now();
        let job_id = job.id;

        if handle.is_cancelled() {
            return self.cancel(job, handle, "before start").await;
        }
        if let Err(e) = job.config.validate() {
            return self.fail(job, handle, Stage::Acquire, e.into()).await;
        }
        let stream = match self.sources.open(&job.data_source_ref, job.time_range.as_ref()) {
            Ok(stream) => stream,
            Err(e) => return self.fail(job, handle, Stage::Acquire, e.into()).await,
        };

        job.transition(JobState::Running)?;
        handle.publish(JobState::Running);
        info!(%job_id, source = %job.data_source_ref.kind, location = %job.data_source_ref.location, "job started");

        let collected = tokio::task::spawn_blocking(move || stream.collect::<Result<Vec<Record>, ConnectorError>>())
            .await
            .map_err(internal)?;
        let mut records = match collected {
            Ok(records) => records,
            Err(e) => return self.fail(job, handle, Stage::Acquire, e.into()).await,
        };
        if handle.is_cancelled() {
            return self.cancel(job, handle, "after acquisition").await;
        }
        if records.is_empty() {
            return self.fail(job, handle, Stage::Acquire, JobError::NoRecords).await;
        }

        canonical_order(&mut records);
        let records = Arc::new(records);
        let extractor = FeatureExtractor::new(job.config.grouping.clone());
        let extracted = {
            let records = records.clone();
            tokio::task::spawn_blocking(move || extractor.extract(&records))
                .await
                .map_err(internal)?
        };
        let features = match extracted {
            Ok(features) => Arc::new(features),
            Err(e) => return self.fail(job, handle, Stage::Extract, e.into()).await,
        };
        info!(%job_id, records = records.len(), dimensions = features.names.len(), categories = features.frequencies.category_count(), "features extracted");
        if handle.is_cancelled() {
            return self.cancel(job, handle, "after extraction").await;
        }

        let config = Arc::new(job.config.clone());
        let statistical = {
            let (config, features) = (config.clone(), features.clone());
            async move {
                if !config.selects(Detector::Statistical) {
                    return None;
                }
                Some(
                    tokio::task::spawn_blocking(move || {
                        StatisticalDetector::new(&config.statistical, config.sensitivity).detect(&features)
                    })
                    .await,
                )
            }
        };
        let pattern = {
            let (config, records, features, library) =
                (config.clone(), records.clone(), features.clone(), self.signatures.clone());
            async move {
                if !config.selects(Detector::Pattern) {
                    return None;
                }
                Some(
                    tokio::task::spawn_blocking(move || PatternDetector::new(&library).detect(&records, &features)).await,
                )
            }
        };
        let semantic = {
            let (config, records, features) = (config.clone(), records.clone(), features.clone());
            let provider = self.provider.clone();
            let token = handle.token().clone();
            async move {
                if !config.selects(Detector::Semantic) {
                    return None;
                }
                let Some(provider) = provider else {
                    return Some(None);
                };
                let analyzer = SemanticAnalyzer::new(provider, config.llm_batch_size, config.semantic.clone());
                Some(Some(
                    tokio::spawn(async move { analyzer.analyze(&records, &features, &token).await }).await,
                ))
            }
        };
        let (statistical, pattern, semantic) = tokio::join!(statistical, pattern, semantic);
        let results = DetectorResults {
            statistical,
            pattern,
            semantic,
        };
        self.settle(job, handle, records.len(), started, results).await
    }

    /// Fold detector results into the job, then aggregate, report and persist.
    async fn settle(
        &self,
        mut job: AnalysisJob,
        handle: &JobHandle,
        record_count: usize,
        started: Instant,
        results: DetectorResults,
    ) -> Result<JobOutcome, JobError> {
        let job_id = job.id;
        let DetectorResults {
            statistical,
            pattern,
            semantic,
        } = results;

        let mut candidates: Vec<AnomalyCandidate> = Vec::new();
        let mut produced = false;
        let (mut core_selected, mut core_failed) = (0, 0);

        if let Some(result) = statistical {
            core_selected += 1;
            match result {
                Ok(StatisticalOutcome {
                    candidates: found,
                    outlier_error,
                }) => {
                    produced = true;
                    if let Some(e) = outlier_error {
                        job.log(Stage::Outlier, "insufficient_data", e.to_string(), false);
                        job.degraded_detectors.insert(DetectorKind::Outlier);
                    }
                    candidates.extend(found);
                }
                Err(e) => {
                    core_failed += 1;
                    error!(%job_id, detector = "statistical", error = %e, "detector task failed");
                    job.log(Stage::Outlier, "detector_failed", e.to_string(), false);
                    job.degraded_detectors.insert(DetectorKind::Outlier);
                    job.degraded_detectors.insert(DetectorKind::Burst);
                }
            }
        }

        if let Some(result) = pattern {
            core_selected += 1;
            match result {
                Ok(found) => {
                    produced = true;
                    candidates.extend(found);
                }
                Err(e) => {
                    core_failed += 1;
                    error!(%job_id, detector = "pattern", error = %e, "detector task failed");
                    job.log(Stage::Pattern, "detector_failed", e.to_string(), false);
                    job.degraded_detectors.insert(DetectorKind::Pattern);
                }
            }
        }

        match semantic {
            None => {}
            Some(None) => {
                warn!(%job_id, "semantic detector selected but no LLM provider is configured");
                job.log(Stage::Semantic, "unavailable", "no LLM provider configured", false);
                job.degraded_detectors.insert(DetectorKind::Semantic);
            }
            Some(Some(Err(e))) => {
                error!(%job_id, detector = "semantic", error = %e, "detector task failed");
                job.log(Stage::Semantic, "detector_failed", e.to_string(), false);
                job.degraded_detectors.insert(DetectorKind::Semantic);
            }
            Some(Some(Ok(outcome))) => {
                produced |= record_semantic(&mut job, &outcome);
                candidates.extend(outcome.candidates);
            }
        }

        if handle.is_cancelled() {
            return self.cancel(job, handle, "after detectors").await;
        }
        if (core_selected > 0 && core_failed == core_selected) || !produced {
            return self.fail(job, handle, Stage::Aggregate, JobError::NoUsableDetector).await;
        }

        let mut per_kind: BTreeMap<DetectorKind, usize> = BTreeMap::new();
        for c in &candidates {
            *per_kind.entry(c.detector_kind).or_insert(0) += 1;
        }
        let anomalies = match SeverityAggregator::new(&job.config.severity).aggregate(candidates) {
            Ok(anomalies) => anomalies,
            Err(e) => return self.fail(job, handle, Stage::Aggregate, JobError::Aggregation(e)).await,
        };

        let report_provider = self
            .provider
            .clone()
            .filter(|_| job.config.selects(Detector::Semantic) && !job.degraded_detectors.contains(&DetectorKind::Semantic));
        let (report, report_error) = Reporter::new(report_provider, job.config.semantic.call_timeout_secs)
            .generate(record_count, &anomalies, &job.degraded_detectors, handle.token())
            .await;
        if let Some(e) = report_error {
            job.log(Stage::Report, e.kind(), format!("report built from template: {}", e), false);
        }
        job.report = Some(report);

        if handle.is_cancelled() {
            return self.cancel(job, handle, "before finalize").await;
        }

        let final_state = if job.degraded_detectors.is_empty() {
            JobState::Completed
        } else {
            JobState::CompletedPartial
        };
        job.created_anomalies = anomalies.iter().map(|a| a.fingerprint.clone()).collect();
        job.metrics = Some(JobMetrics::compute(
            record_count,
            per_kind,
            &anomalies,
            started.elapsed().as_millis() as u64,
        ));
        job.transition(final_state)?;

        let (job, anomalies) = self.persist(job, anomalies).await?;
        handle.publish(final_state);
        info!(
            %job_id,
            state = %final_state,
            anomalies = anomalies.len(),
            degraded = job.degraded_detectors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        Ok(JobOutcome {
            job,
            anomalies,
            failure: None,
        })
    }

    async fn fail(&self, mut job: AnalysisJob, handle: &JobHandle, stage: Stage, err: JobError) -> Result<JobOutcome, JobError> {
        warn!(job_id = %job.id, %stage, error = %err, "job failed");
        job.log(stage, err.kind(), err.to_string(), true);
        job.transition(JobState::Failed)?;
        let (job, _) = self.persist(job, Vec::new()).await?;
        handle.publish(JobState::Failed);
        Ok(JobOutcome {
            job,
            anomalies: Vec::new(),
            failure: Some(err),
        })
    }

    async fn cancel(&self, mut job: AnalysisJob, handle: &JobHandle, checkpoint: &str) -> Result<JobOutcome, JobError> {
        info!(job_id = %job.id, checkpoint, "job cancelled");
        job.log(Stage::Cancel, "cancelled", format!("cancellation observed {}", checkpoint), true);
        job.transition(JobState::Cancelled)?;
        let (job, _) = self.persist(job, Vec::new()).await?;
        handle.publish(JobState::Cancelled);
        Ok(JobOutcome {
            job,
            anomalies: Vec::new(),
            failure: None,
        })
    }

    async fn persist(&self, job: AnalysisJob, anomalies: Vec<Anomaly>) -> Result<(AnalysisJob, Vec<Anomaly>), JobError> {
        let store = self.store.clone();
        let (job, anomalies, saved) = tokio::task::spawn_blocking(move || {
            let saved = store.save_job_result(&job, &anomalies);
            (job, anomalies, saved)
        })
        .await
        .map_err(internal)?;
        if let Err(e) = saved {
            error!(job_id = %job.id, error = %e, "failed to persist job result");
            return Err(e.into());
        }
        Ok((job, anomalies))
    }
}

/// Log semantic batch failures on the job. Returns whether the stage produced results.
fn record_semantic(job: &mut AnalysisJob, outcome: &SemanticOutcome) -> bool {
    for failure in &outcome.failures {
        job.log(
            Stage::Semantic,
            failure.error.kind(),
            format!(
                "batch {} skipped after {} attempt(s): {}",
                failure.batch, failure.attempts, failure.error
            ),
            false,
        );
    }
    if outcome.aborted {
        let skipped = outcome.batches_total.saturating_sub(outcome.batches_ok + outcome.failures.len());
        job.log(
            Stage::Semantic,
            "aborted",
            format!("authentication failed, {} remaining batch(es) not sent", skipped),
            false,
        );
    }
    if !outcome.failures.is_empty() {
        job.degraded_detectors.insert(DetectorKind::Semantic);
    }
    outcome.batches_ok > 0 || outcome.batches_total == 0
}

fn internal(e: JoinError) -> JobError {
    JobError::Internal(format!("task failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::memory::MemorySource;
    use crate::storage::SqliteStore;
    use serde_json::json;

    fn orchestrator() -> (Orchestrator, SqliteStore) {
        let store = SqliteStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(SourceRegistry::with_defaults(MemorySource::new())),
            Arc::new(SignatureLibrary::builtin()),
            None,
            Arc::new(store.clone()),
        );
        (orchestrator, store)
    }

    fn running_job(detectors: &[Detector]) -> (AnalysisJob, JobHandle) {
        let config = DetectorConfig {
            detectors: detectors.iter().copied().collect(),
            ..DetectorConfig::default()
        };
        let mut job = AnalysisJob::new(DataSourceRef::new("memory", "ops"), None, config);
        job.transition(JobState::Running).unwrap();
        let handle = JobHandle::new(job.id);
        handle.publish(JobState::Running);
        (job, handle)
    }

    fn blow_up() {
        panic!("detector blew up")
    }

    async fn panicked() -> JoinError {
        tokio::spawn(async { blow_up() }).await.unwrap_err()
    }

    fn oom_hit(record: &str) -> AnomalyCandidate {
        AnomalyCandidate {
            record_id: record.to_string(),
            related_records: Vec::new(),
            detector_kind: DetectorKind::Pattern,
            category: "kernel/out of memory".to_string(),
            raw_score: 0.9,
            evidence: json!({ "signature_id": "oom", "signature_name": "Out of memory" }),
            rationale: None,
        }
    }

    #[tokio::test]
    async fn test_panicking_statistical_detector_degrades() {
        let (orchestrator, store) = orchestrator();
        let (job, handle) = running_job(&[Detector::Statistical, Detector::Pattern]);
        let results = DetectorResults {
            statistical: Some(Err(panicked().await)),
            pattern: Some(Ok(vec![oom_hit("r1")])),
            semantic: None,
        };

        let outcome = orchestrator.settle(job, &handle, 12, Instant::now(), results).await.unwrap();
        assert_eq!(outcome.job.state, JobState::CompletedPartial);
        assert_eq!(handle.state(), JobState::CompletedPartial);
        assert_eq!(
            outcome.job.degraded_detectors,
            [DetectorKind::Outlier, DetectorKind::Burst].into_iter().collect()
        );
        assert!(outcome
            .job
            .error_log
            .iter()
            .any(|e| e.stage == Stage::Outlier && e.kind == "detector_failed" && !e.fatal));
        assert_eq!(outcome.anomalies.len(), 1);

        let report = outcome.job.report.as_ref().unwrap();
        assert_eq!(report.source, crate::job::ReportSource::Template);
        assert!(report.summary.contains("Degraded detectors: outlier, burst."));
        assert_eq!(store.load_job(outcome.job.id).unwrap().unwrap().state, JobState::CompletedPartial);
    }

    #[tokio::test]
    async fn test_all_core_detectors_failing_fails_job() {
        let (orchestrator, store) = orchestrator();
        let (job, handle) = running_job(&[Detector::Statistical, Detector::Pattern]);
        let results = DetectorResults {
            statistical: Some(Err(panicked().await)),
            pattern: Some(Err(panicked().await)),
            semantic: None,
        };

        let outcome = orchestrator.settle(job, &handle, 12, Instant::now(), results).await.unwrap();
        assert_eq!(outcome.job.state, JobState::Failed);
        assert!(matches!(outcome.failure, Some(JobError::NoUsableDetector)));
        assert!(outcome.anomalies.is_empty());
        let last = outcome.job.error_log.last().unwrap();
        assert!(last.fatal);
        assert_eq!(last.kind, "no_usable_detector");
        assert!(store.load_anomalies(outcome.job.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_semantic_without_provider_degrades() {
        let (orchestrator, _store) = orchestrator();
        let (job, handle) = running_job(&[Detector::Pattern, Detector::Semantic]);
        let results = DetectorResults {
            statistical: None,
            pattern: Some(Ok(vec![oom_hit("r1"), oom_hit("r2")])),
            semantic: Some(None),
        };

        let outcome = orchestrator.settle(job, &handle, 2, Instant::now(), results).await.unwrap();
        assert_eq!(outcome.job.state, JobState::CompletedPartial);
        assert_eq!(
            outcome.job.degraded_detectors,
            [DetectorKind::Semantic].into_iter().collect()
        );
        assert_eq!(outcome.anomalies.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_observed_after_detectors() {
        let (orchestrator, _store) = orchestrator();
        let (job, handle) = running_job(&[Detector::Pattern]);
        handle.cancel();
        let results = DetectorResults {
            statistical: None,
            pattern: Some(Ok(vec![oom_hit("r1")])),
            semantic: None,
        };

        let outcome = orchestrator.settle(job, &handle, 1, Instant::now(), results).await.unwrap();
        assert_eq!(outcome.job.state, JobState::Cancelled);
        assert!(outcome.anomalies.is_empty());
        assert!(outcome.job.report.is_none());
    }
}

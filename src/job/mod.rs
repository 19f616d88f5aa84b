//! Analysis jobs: lifecycle state, error log, and the handle callers hold.

pub mod orchestrator;
pub mod queue;
pub mod report;

use crate::config::{ConfigError, DetectorConfig};
use crate::detect::aggregate::Anomaly;
use crate::detect::{DetectError, DetectorKind, Severity};
use crate::features::ExtractError;
use crate::record::TimeRange;
use crate::sources::{ConnectorError, DataSourceRef};
use crate::storage::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use orchestrator::{JobOutcome, Orchestrator};
pub use queue::JobQueue;
pub use report::{JobReport, ReportSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    CompletedPartial,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::CompletedPartial | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match self {
            // A job rejected before it starts (bad config, unreachable source) fails from pending.
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Completed | CompletedPartial | Failed | Cancelled),
            Completed | CompletedPartial | Failed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::CompletedPartial => "completed_partial",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "completed_partial" => Ok(JobState::CompletedPartial),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Pipeline stage an error log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Extract,
    Outlier,
    Burst,
    Pattern,
    Semantic,
    Aggregate,
    Report,
    Persist,
    Cancel,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Acquire => "acquire",
            Stage::Extract => "extract",
            Stage::Outlier => "outlier",
            Stage::Burst => "burst",
            Stage::Pattern => "pattern",
            Stage::Semantic => "semantic",
            Stage::Aggregate => "aggregate",
            Stage::Report => "report",
            Stage::Persist => "persist",
            Stage::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

impl From<DetectorKind> for Stage {
    fn from(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::Outlier => Stage::Outlier,
            DetectorKind::Burst => Stage::Burst,
            DetectorKind::Pattern => Stage::Pattern,
            DetectorKind::Semantic => Stage::Semantic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    /// The entry ended the job.
    pub fatal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub records_analyzed: usize,
    pub candidates_by_detector: BTreeMap<DetectorKind, usize>,
    pub anomalies_total: usize,
    /// Anomalies per analyzed record.
    pub anomaly_rate: f64,
    pub severity_breakdown: BTreeMap<Severity, usize>,
    pub duration_ms: u64,
}

impl JobMetrics {
    pub fn compute(records: usize, candidates: BTreeMap<DetectorKind, usize>, anomalies: &[Anomaly], duration_ms: u64) -> Self {
        let mut severity_breakdown = BTreeMap::new();
        for anomaly in anomalies {
            *severity_breakdown.entry(anomaly.severity).or_insert(0) += 1;
        }
        Self {
            records_analyzed: records,
            candidates_by_detector: candidates,
            anomalies_total: anomalies.len(),
            anomaly_rate: if records == 0 {
                0.0
            } else {
                anomalies.len() as f64 / records as f64
            },
            severity_breakdown,
            duration_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("data source error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("data source produced no records")]
    NoRecords,

    #[error("feature extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("aggregation failed: {0}")]
    Aggregation(#[source] DetectError),

    #[error("no selected detector produced results")]
    NoUsableDetector,

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Short tag used on the job error log.
    ///
    /// An empty source is `no_records` (stage `acquire`). It is distinct from
    /// `insufficient_data`, which only degrades outlier scoring on a non-empty
    /// but small job.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::InvalidConfig(_) => "config_invalid",
            JobError::Connector(e) => match e.kind {
                crate::sources::ConnectorErrorKind::ConfigInvalid => "config_invalid",
                crate::sources::ConnectorErrorKind::Unreachable => "unreachable",
                crate::sources::ConnectorErrorKind::ParseError => "parse_error",
            },
            JobError::NoRecords => "no_records",
            JobError::Extraction(_) => "extraction",
            JobError::Aggregation(_) => "aggregation_invariant",
            JobError::NoUsableDetector => "no_usable_detector",
            JobError::Persistence(_) => "persistence",
            JobError::Internal(_) => "internal",
        }
    }
}

/// A job and everything recorded about its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub data_source_ref: DataSourceRef,
    pub time_range: Option<TimeRange>,
    pub config: DetectorConfig,
    pub state: JobState,
    /// Fingerprints of the anomalies this job finalized.
    pub created_anomalies: Vec<String>,
    pub error_log: Vec<ErrorLogEntry>,
    pub degraded_detectors: BTreeSet<DetectorKind>,
    pub metrics: Option<JobMetrics>,
    #[serde(default)]
    pub report: Option<JobReport>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn new(data_source_ref: DataSourceRef, time_range: Option<TimeRange>, config: DetectorConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_source_ref,
            time_range,
            config,
            state: JobState::Pending,
            created_anomalies: Vec::new(),
            error_log: Vec::new(),
            degraded_detectors: BTreeSet::new(),
            metrics: None,
            report: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    pub fn log(&mut self, stage: Stage, kind: impl Into<String>, message: impl Into<String>, fatal: bool) {
        self.error_log.push(ErrorLogEntry {
            at: Utc::now(),
            stage,
            kind: kind.into(),
            message: message.into(),
            fatal,
        });
    }
}

/// Caller-side view of a job: read state, await completion, request cancellation.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
    state: Arc<watch::Sender<JobState>>,
}

impl JobHandle {
    pub fn new(id: Uuid) -> Self {
        let (tx, _rx) = watch::channel(JobState::Pending);
        Self {
            id,
            cancel: CancellationToken::new(),
            state: Arc::new(tx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Request cancellation; observed at the job's next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn publish(&self, state: JobState) {
        self.state.send_replace(state);
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

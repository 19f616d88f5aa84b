//! Bounded job execution.
//!
//! Submitted jobs run as tokio tasks; a semaphore caps how many run at once
//! and the rest wait in `pending`. Handles stay registered so callers can
//! read state or cancel by id; only the most recent finished ones are kept.

use super::{AnalysisJob, JobHandle, JobState, Orchestrator};
use crate::config::DetectorConfig;
use crate::record::TimeRange;
use crate::sources::DataSourceRef;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Finished handles kept for lookups before the oldest are dropped.
pub const DEFAULT_RETAINED: usize = 256;

#[derive(Default)]
struct Registry {
    handles: HashMap<Uuid, JobHandle>,
    /// Submission order.
    order: VecDeque<Uuid>,
}

impl Registry {
    /// Register a handle, first dropping the oldest terminal ones beyond `retain`.
    fn insert(&mut self, handle: JobHandle, retain: usize) {
        let finished: Vec<Uuid> = self
            .order
            .iter()
            .filter(|id| self.handles.get(*id).is_some_and(|h| h.state().is_terminal()))
            .copied()
            .collect();
        let excess = finished.len().saturating_sub(retain);
        if excess > 0 {
            for id in &finished[..excess] {
                self.handles.remove(id);
            }
            let handles = &self.handles;
            self.order.retain(|id| handles.contains_key(id));
            debug!(evicted = excess, "dropped finished job handles");
        }
        self.order.push_back(handle.id());
        self.handles.insert(handle.id(), handle);
    }
}

#[derive(Clone)]
pub struct JobQueue {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    registry: Arc<RwLock<Registry>>,
    retain: usize,
}

impl JobQueue {
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            registry: Arc::new(RwLock::new(Registry::default())),
            retain: DEFAULT_RETAINED,
        }
    }

    /// Keep at most `retain` finished handles. Their results stay in storage.
    pub fn retain_finished(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Queue a job; returns immediately with its handle.
    pub async fn submit(&self, source: DataSourceRef, range: Option<TimeRange>, config: DetectorConfig) -> JobHandle {
        let (job, handle) = self.orchestrator.prepare(source, range, config);
        self.registry.write().await.insert(handle.clone(), self.retain);
        info!(job_id = %job.id, "job queued");

        let queue = self.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            queue.execute(job, task_handle).await;
        });
        handle
    }

    async fn execute(&self, job: AnalysisJob, handle: JobHandle) {
        let job_id = job.id;
        // Waiting for a slot; a cancel during the wait is seen by the orchestrator's first checkpoint.
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(p) => Some(p),
                Err(_) => {
                    error!(%job_id, "job queue closed");
                    return;
                }
            },
            _ = handle.token().cancelled() => None,
        };

        match self.orchestrator.run(job, &handle).await {
            Ok(outcome) => {
                if let Some(failure) = &outcome.failure {
                    info!(%job_id, error = %failure, "job ended failed");
                }
            }
            Err(e) => error!(%job_id, error = %e, "job could not be finalized"),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<JobHandle> {
        self.registry.read().await.handles.get(&id).cloned()
    }

    /// Ids and current states of every job this queue still tracks.
    pub async fn list(&self) -> Vec<(Uuid, JobState)> {
        let registry = self.registry.read().await;
        let mut out: Vec<(Uuid, JobState)> = registry
            .handles
            .iter().map(|(id, h)| (*id, h.state())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Request cancellation. Returns false for unknown ids.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.get(id).await {
            Some(handle) => {
                handle.cancel();
                info!(job_id = %id, "cancellation requested");
                true
            }
            None => false,
        }
    }
}

//! signalsift -- multi-detector anomaly detection for operational records.
//!
//! This crate provides the core library: connectors that normalize records,
//! feature extraction, statistical, pattern and semantic detectors, severity
//! aggregation, the job orchestrator, and SQLite persistence.

pub mod api;
pub mod config;
pub mod detect;
pub mod features;
pub mod job;
pub mod llm;
pub mod record;
pub mod sources;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::detect::Detector;
use crate::job::{JobQueue, Orchestrator};
use crate::llm::ProviderRegistry;
use crate::sources::memory::MemorySource;
use crate::sources::SourceRegistry;
use crate::storage::{Persistence, SqliteStore};

/// Wire an orchestrator from configuration.
///
/// If the semantic detector is selected but no provider can be built, it is
/// removed from `config.analysis` with a warning so jobs do not run degraded
/// by default.
pub fn build_orchestrator(config: &mut EngineConfig, store: &SqliteStore, memory: MemorySource) -> Result<Orchestrator> {
    let signatures = store
        .load_signature_library()
        .context("failed to load signature library")?;

    let provider = match ProviderRegistry::with_defaults().build(&config.llm) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::warn!(error = %e, "LLM provider unavailable");
            None
        }
    };
    if provider.is_none() && config.analysis.detectors.remove(&Detector::Semantic) {
        tracing::warn!("semantic detector disabled: no LLM provider configured");
        if config.analysis.detectors.is_empty() {
            anyhow::bail!("no detectors left to run: configure an LLM provider or select statistical/pattern");
        }
    }

    Ok(Orchestrator::new(
        Arc::new(SourceRegistry::with_defaults(memory)),
        Arc::new(signatures),
        provider,
        Arc::new(store.clone()) as Arc<dyn Persistence>,
    ))
}

/// Start the signalsift daemon: job queue and read-only API server.
pub async fn serve(mut config: EngineConfig) -> Result<()> {
    tracing::info!(db_path = %config.storage.path, "Initializing database");
    let store = SqliteStore::open(&config.storage.path)?;

    let orchestrator = build_orchestrator(&mut config, &store, MemorySource::new())?;
    let queue = JobQueue::new(Arc::new(orchestrator), config.jobs.max_concurrent)
        .retain_finished(config.jobs.retain_finished);

    let state = api::state::AppState {
        queue,
        store,
        template: Arc::new(config.analysis.clone()),
        data_root: config.server.data_root.clone(),
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    tracing::info!(%addr, "signalsift listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}

//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use crate::detect::aggregate::Anomaly;
use crate::detect::pattern::{default_signatures, Signature, SignatureError, SignatureLibrary};
use crate::detect::Severity;
use crate::job::{AnalysisJob, JobState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const MEMORY_PATH: &str = ":memory:";

/// Open (or create) the SQLite database and return a connection pool.
///
/// `:memory:` opens a private in-memory database behind a single connection.
pub fn open_pool(path: &str) -> Result<Pool> {
    let init = |c: &mut rusqlite::Connection| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    };

    let pool = if path == MEMORY_PATH {
        R2D2Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory().with_init(init))?
    } else {
        R2D2Pool::new(SqliteConnectionManager::file(path).with_init(init))?
    };

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("signature library: {0}")]
    Signatures(#[from] SignatureError),
}

/// Where finished jobs are written and signatures are read from.
pub trait Persistence: Send + Sync {
    /// Write the job and its anomalies in one transaction.
    fn save_job_result(&self, job: &AnalysisJob, anomalies: &[Anomaly]) -> Result<(), PersistenceError>;

    fn load_signature_library(&self) -> Result<SignatureLibrary, PersistenceError>;
}

/// One row of the job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub state: String,
    pub source_kind: String,
    pub location: String,
    pub anomaly_count: i64,
    pub created_at: String,
    pub finished_at: Option<String>,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    /// Open the database at `path` and seed the built-in signatures if none exist.
    pub fn open(path: &str) -> Result<Self> {
        info!(%path, "opening database");
        let store = Self {
            pool: open_pool(path)?,
        };
        store.seed_signatures()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY_PATH)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn seed_signatures(&self) -> Result<(), PersistenceError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM signatures", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(());
        }
        let defaults = default_signatures();
        for signature in &defaults {
            insert_signature(&conn, signature)?;
        }
        info!(count = defaults.len(), "seeded built-in signatures");
        Ok(())
    }

    /// Signatures in registration order.
    pub fn list_signatures(&self) -> Result<Vec<Signature>, PersistenceError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT signature_json FROM signatures ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    /// Register a signature after checking it compiles alongside the existing library.
    pub fn add_signature(&self, signature: &Signature) -> Result<(), PersistenceError> {
        let mut all = self.list_signatures()?;
        all.push(signature.clone());
        SignatureLibrary::new(all)?;

        let conn = self.pool.get()?;
        insert_signature(&conn, signature)?;
        info!(id = %signature.id, priority = signature.priority, "signature added");
        Ok(())
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobSummary>, PersistenceError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, state, source_kind, location, anomaly_count, created_at, finished_at
             FROM analysis_jobs ORDER BY created_at DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(JobSummary {
                id: row.get(0)?,
                state: row.get(1)?,
                source_kind: row.get(2)?,
                location: row.get(3)?,
                anomaly_count: row.get(4)?,
                created_at: row.get(5)?,
                finished_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn load_job(&self, id: Uuid) -> Result<Option<AnalysisJob>, PersistenceError> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT job_json FROM analysis_jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => Some(serde_json::from_str(&j)?),
            None => None,
        })
    }

    /// Anomalies of a job in their finalized order.
    pub fn load_anomalies(&self, job_id: Uuid) -> Result<Vec<Anomaly>, PersistenceError> {
        self.query_anomalies(job_id, None)
    }

    /// Anomalies of a job, optionally only those of one severity tier.
    pub fn query_anomalies(&self, job_id: Uuid, severity: Option<Severity>) -> Result<Vec<Anomaly>, PersistenceError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT anomaly_json FROM anomalies
             WHERE job_id = ?1 AND (?2 IS NULL OR severity = ?2)
             ORDER BY id",
        )?;
        let severity = severity.map(|s| s.to_string());
        let rows = stmt.query_map(params![job_id.to_string(), severity], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }
}

impl Persistence for SqliteStore {
    fn save_job_result(&self, job: &AnalysisJob, anomalies: &[Anomaly]) -> Result<(), PersistenceError> {
        let job_json = serde_json::to_string(job)?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO analysis_jobs
                (id, state, source_kind, location, anomaly_count, job_json, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.state.as_str(),
                job.data_source_ref.kind,
                job.data_source_ref.location,
                anomalies.len() as i64,
                job_json,
                job.created_at.to_rfc3339(),
                job.finished_at.map(|t: DateTime<Utc>| t.to_rfc3339()),
            ],
        )?;
        tx.execute("DELETE FROM anomalies WHERE job_id = ?1", params![job.id.to_string()])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO anomalies (job_id, fingerprint, severity, combined_score, category, anomaly_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for anomaly in anomalies {
                stmt.execute(params![
                    job.id.to_string(),
                    anomaly.fingerprint,
                    anomaly.severity.to_string(),
                    anomaly.combined_score,
                    anomaly.category,
                    serde_json::to_string(anomaly)?,
                ])?;
            }
        }

        tx.commit()?;
        debug!(job_id = %job.id, state = %job.state, anomalies = anomalies.len(), "job result saved");
        Ok(())
    }

    fn load_signature_library(&self) -> Result<SignatureLibrary, PersistenceError> {
        Ok(SignatureLibrary::new(self.list_signatures()?)?)
    }
}

fn insert_signature(conn: &rusqlite::Connection, signature: &Signature) -> Result<(), PersistenceError> {
    conn.execute(
        "INSERT INTO signatures (id, priority, signature_json) VALUES (?1, ?2, ?3)",
        params![signature.id, signature.priority, serde_json::to_string(signature)?],
    )?;
    Ok(())
}

/// Count jobs by state, for the health endpoint.
pub fn job_state_counts(pool: &Pool) -> Result<Vec<(JobState, i64)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM analysis_jobs GROUP BY state ORDER BY state")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        let (state, count) = row?;
        let state = state.parse::<JobState>().map_err(anyhow::Error::msg)?;
        out.push((state, count));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detect::pattern::Matcher;
    use crate::sources::DataSourceRef;

    #[test]
    fn test_defaults_seeded_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.list_signatures().unwrap().len(), default_signatures().len());
        store.seed_signatures().unwrap();
        assert_eq!(store.list_signatures().unwrap().len(), default_signatures().len());
        assert_eq!(store.load_signature_library().unwrap().len(), default_signatures().len());
    }

    #[test]
    fn test_add_signature_validates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sig = Signature {
            id: "billing-failure".into(),
            name: "Billing failure".into(),
            matcher: Matcher::Literal {
                text: "charge declined".into(),
                case_insensitive: true,
            },
            priority: 5,
            weight: 0.7,
            category: "billing".into(),
        };
        store.add_signature(&sig).unwrap();
        let library = store.load_signature_library().unwrap();
        assert_eq!(library.first_match("Charge DECLINED for order 9").unwrap().0.id, "billing-failure");

        // Same id again
        assert!(matches!(
            store.add_signature(&sig),
            Err(PersistenceError::Signatures(SignatureError::DuplicateId(_)))
        ));
    }

    #[test]
    fn test_save_and_load_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut job = AnalysisJob::new(DataSourceRef::new("memory", "x"), None, DetectorConfig::default());
        job.transition(JobState::Failed).unwrap();
        store.save_job_result(&job, &[]).unwrap();

        let loaded = store.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(store.load_anomalies(job.id).unwrap().is_empty());
        let listed = store.list_jobs(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, "failed");
        assert_eq!(job_state_counts(store.pool()).unwrap(), vec![(JobState::Failed, 1)]);
        assert!(store.load_job(Uuid::new_v4()).unwrap().is_none());
    }
}

//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS analysis_jobs (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            location TEXT NOT NULL,
            anomaly_count INTEGER NOT NULL DEFAULT 0,
            job_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY,
            job_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            severity TEXT NOT NULL,
            combined_score REAL NOT NULL,
            category TEXT NOT NULL,
            anomaly_json TEXT NOT NULL,
            UNIQUE (job_id, fingerprint),
            FOREIGN KEY (job_id) REFERENCES analysis_jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS signatures (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            priority INTEGER NOT NULL,
            signature_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_created ON analysis_jobs(created_at);
        CREATE INDEX IF NOT EXISTS idx_anomalies_job ON anomalies(job_id);
        CREATE INDEX IF NOT EXISTS idx_anomalies_severity ON anomalies(severity);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

use crate::config::DetectorConfig;
use crate::job::JobQueue;
use crate::storage::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    pub store: SqliteStore,
    /// Analysis settings new jobs start from.
    pub template: Arc<DetectorConfig>,
    /// Root that HTTP-submitted file sources are confined to.
    pub data_root: Option<PathBuf>,
}

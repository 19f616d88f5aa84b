use super::{ConnectorError, DataSource, DataSourceRef, RecordStream};
use crate::record::{Record, TimeRange};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub const KIND: &str = "memory";

/// Named record sets handed in by the caller. `location` names the set.
#[derive(Clone, Default)]
pub struct MemorySource {
    sets: Arc<RwLock<BTreeMap<String, Arc<Vec<Record>>>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a record set under `name`.
    pub fn insert(&self, name: impl Into<String>, records: Vec<Record>) {
        let mut sets = match self.sets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sets.insert(name.into(), Arc::new(records));
    }
}

impl DataSource for MemorySource {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn stream(&self, source: &DataSourceRef, range: Option<&TimeRange>) -> Result<RecordStream, ConnectorError> {
        let records = {
            let sets = self
                .sets
                .read()
                .map_err(|_| ConnectorError::unreachable("memory store lock poisoned"))?;
            sets.get(&source.location)
                .cloned()
                .ok_or_else(|| ConnectorError::unreachable(format!("no record set named '{}'", source.location)))?
        };
        let range = range.copied();
        let len = records.len();
        Ok(Box::new(
            (0..len)
                .map(move |i| records[i].clone())
                .filter(move |r| range.map_or(true, |tr| tr.contains(r.timestamp)))
                .map(Ok),
        ))
    }
}

use async_trait::async_trait;
use std::{collections::VecDeque, sync::Mutex};

use crate::{
    error::{IngestError, Result},
    model::WeatherSnapshot,
};

use super::SnapshotStore;

/// In-process store used for dry runs and tests.
///
/// Failures can be queued with [`MemoryStore::push_failure`]; each queued error is
/// returned by the next `persist` call instead of writing a row.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    schema_ready: bool,
    schema_failure: Option<String>,
    ensure_calls: usize,
    persist_calls: usize,
    rows: Vec<WeatherSnapshot>,
    queued_failures: VecDeque<IngestError>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `ensure_schema` call fail with the given message.
    pub fn failing_schema(message: impl Into<String>) -> Self {
        let store = Self::default();
        store.lock().schema_failure = Some(message.into());
        store
    }

    pub fn push_failure(&self, err: IngestError) {
        self.lock().queued_failures.push_back(err);
    }

    pub fn rows(&self) -> Vec<WeatherSnapshot> {
        self.lock().rows.clone()
    }

    pub fn ensure_calls(&self) -> usize {
        self.lock().ensure_calls
    }

    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock only means a test panicked mid-call; the data is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_calls += 1;
        if let Some(message) = &inner.schema_failure {
            return Err(IngestError::Schema(message.clone()));
        }
        inner.schema_ready = true;
        Ok(())
    }

    async fn persist(&self, snapshot: &WeatherSnapshot) -> Result<()> {
        let mut inner = self.lock();
        inner.persist_calls += 1;
        if let Some(err) = inner.queued_failures.pop_front() {
            return Err(err);
        }
        if !inner.schema_ready {
            return Err(IngestError::fatal_write("relation \"weather_data\" does not exist"));
        }
        inner.rows.push(snapshot.clone());
        Ok(())
    }
}

//! Shared anchor store
//!
//! One store exists per run. Every composed spec, step, DB check and the
//! response observer hold a clone of the same handle, so a write anywhere is
//! visible to every later read.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    values: BTreeMap<String, String>,
    writes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnchorStore {
    inner: Arc<Mutex<Inner>>,
}

impl AnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from the root spec's `anchors`. Seeds are not recorded
    /// in the write log.
    pub fn seeded(seed: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                values: seed,
                writes: Vec::new(),
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().values.get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().values.contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        debug!(anchor = %key, value = %value, "anchor written");
        let mut inner = self.inner.lock();
        inner.writes.push(key.clone());
        inner.values.insert(key, value);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().values.clone()
    }

    /// Keys in the order they were written during the run.
    pub fn write_log(&self) -> Vec<String> {
        self.inner.lock().writes.clone()
    }
}

use crate::tenant::SchemaName;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-schema mutual exclusion for structural work (migrate, backup, restore, drop).
#[derive(Default)]
pub struct SchemaLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SchemaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, schema: &SchemaName) -> Arc<Mutex<()>> {
        self.locks
            .entry(schema.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits until no other operation holds `schema`.
    pub async fn lock(&self, schema: &SchemaName) -> OwnedMutexGuard<()> {
        let mutex = self.mutex_for(schema);
        if let Ok(guard) = mutex.clone().try_lock_owned() {
            return guard;
        }
        debug!("Waiting for lock on schema {}", schema);
        mutex.lock_owned().await
    }

    pub fn try_lock(&self, schema: &SchemaName) -> Option<OwnedMutexGuard<()>> {
        self.mutex_for(schema).try_lock_owned().ok()
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::models::{Record, UNIQ_REF_FIELD};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Keyed async mutex serializing handlers that touch the same entity.
///
/// Entries are created on demand and removed once the last holder or
/// waiter is gone, so the map only grows with concurrently hot keys.
#[derive(Debug, Clone, Default)]
pub struct EntityLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held while a handler runs; releases the key on drop
#[derive(Debug)]
pub struct EntityGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other handler holds `key`
    pub async fn lock(&self, key: String) -> EntityGuard {
        let mutex = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;

        EntityGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.inner),
        }
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut map = self.locks.lock();
        let idle = map
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
        if idle {
            map.remove(&self.key);
        }
    }
}

/// Serialization key of an event: `<entity>:<id>`.
///
/// The entity is the first routing-key segment. The id is read from the
/// field named `<entity>ID` (any casing), falling back to `uniqRef`. Events
/// carrying neither are not serialized.
pub fn lock_key(routing_key: &str, data: &Record) -> Option<String> {
    let entity = routing_key.split('.').next().filter(|segment| !segment.is_empty())?;
    let id_field = format!("{}id", entity.to_lowercase());

    let id = data
        .iter()
        .find(|(field, _)| field.to_lowercase() == id_field)
        .map(|(_, value)| value)
        .or_else(|| data.get(UNIQ_REF_FIELD))
        .and_then(|value| match value {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })?;

    Some(format!("{}:{}", entity.to_lowercase(), id))
}

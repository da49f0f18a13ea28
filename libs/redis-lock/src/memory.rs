//! In-memory [`ConditionalStore`] for tests.
//!
//! Implements the same conditional-operation contract as
//! [`RedisStore`](crate::RedisStore) with per-key version counters and
//! millisecond expiry, so lock and transaction semantics can be exercised
//! without a running Redis. Exported so downstream crates can inject it
//! into their own tests the same way.
//!
//! Supports the core batch operations (get/set/del/incr); store-native
//! passthrough commands are rejected with
//! [`LockError::UnsupportedCommand`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::Value;

use crate::error::{LockError, LockResult};
use crate::store::{ConditionalStore, WatchGuard};
use crate::transaction::{BatchOp, CommandBatch};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Shared {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
}

impl Shared {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.map_or(false, |at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            // Expiry is a modification as far as watchers are concerned.
            self.bump(&key);
        }
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

/// In-memory store with the same atomicity contract as Redis.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct write bypassing the conditional primitives. Test helper for
    /// simulating another actor mutating a watched key.
    pub fn force_set(&self, key: &str, value: &str) {
        let mut shared = self.lock();
        shared.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        shared.bump(key);
    }

    /// Direct delete, same purpose as [`force_set`](Self::force_set).
    pub fn force_del(&self, key: &str) {
        let mut shared = self.lock();
        if shared.entries.remove(key).is_some() {
            shared.bump(key);
        }
    }

    /// Remaining time before `key` expires, if it exists and has a TTL.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let mut shared = self.lock();
        shared.purge_expired();
        shared
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ConditionalStore for MemoryStore {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let mut shared = self.lock();
        shared.purge_expired();
        if shared.entries.contains_key(key) {
            return Ok(false);
        }
        shared.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        shared.bump(key);
        Ok(true)
    }

    async fn delete_if_equal(&self, key: &str, expected: &str) -> LockResult<bool> {
        let mut shared = self.lock();
        shared.purge_expired();
        match shared.entries.get(key) {
            Some(entry) if entry.value == expected => {
                shared.entries.remove(key);
                shared.bump(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh_if_equal(&self, key: &str, expected: &str, ttl: Duration) -> LockResult<bool> {
        let mut shared = self.lock();
        shared.purge_expired();
        match shared.entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                shared.bump(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read(&self, key: &str) -> LockResult<Option<String>> {
        let mut shared = self.lock();
        shared.purge_expired();
        Ok(shared.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn exists(&self, key: &str) -> LockResult<bool> {
        let mut shared = self.lock();
        shared.purge_expired();
        Ok(shared.entries.contains_key(key))
    }

    async fn watch(&self, keys: &[String]) -> LockResult<Box<dyn WatchGuard>> {
        let mut shared = self.lock();
        shared.purge_expired();
        let pinned = keys
            .iter()
            .map(|key| (key.clone(), shared.version(key)))
            .collect();
        Ok(Box::new(MemoryWatchGuard {
            store: self.clone(),
            pinned,
        }))
    }
}

struct MemoryWatchGuard {
    store: MemoryStore,
    pinned: Vec<(String, u64)>,
}

#[async_trait]
impl WatchGuard for MemoryWatchGuard {
    async fn commit(self: Box<Self>, batch: &CommandBatch) -> LockResult<Option<Vec<Value>>> {
        // Zero queued operations commit trivially, as an empty MULTI/EXEC
        // would.
        if batch.is_empty() {
            return Ok(Some(Vec::new()));
        }

        // All-or-nothing: reject anything unsupported before touching state.
        for op in batch.ops() {
            if let BatchOp::Command { name, .. } = op {
                return Err(LockError::UnsupportedCommand(name.clone()));
            }
        }

        let mut shared = self.store.lock();
        shared.purge_expired();
        for (key, version) in &self.pinned {
            if shared.version(key) != *version {
                return Ok(None);
            }
        }

        let mut results = Vec::with_capacity(batch.ops().len());
        for op in batch.ops() {
            results.push(apply(&mut shared, op)?);
        }
        Ok(Some(results))
    }

    async fn abort(self: Box<Self>) {}
}

fn apply(shared: &mut Shared, op: &BatchOp) -> LockResult<Value> {
    match op {
        BatchOp::Get { key } => Ok(match shared.entries.get(key) {
            Some(entry) => Value::Data(entry.value.clone().into_bytes()),
            None => Value::Nil,
        }),
        BatchOp::Set { key, value, ttl } => {
            shared.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            shared.bump(key);
            Ok(Value::Okay)
        }
        BatchOp::Del { key } => {
            let removed = shared.entries.remove(key).is_some();
            if removed {
                shared.bump(key);
            }
            Ok(Value::Int(removed as i64))
        }
        BatchOp::Incr { key, delta } => {
            let current = match shared.entries.get(key) {
                Some(entry) => entry.value.parse::<i64>().map_err(|_| {
                    LockError::Redis(redis::RedisError::from((
                        redis::ErrorKind::TypeError,
                        "value is not an integer or out of range",
                    )))
                })?,
                None => 0,
            };
            let next = current + delta;
            shared.entries.insert(
                key.clone(),
                Entry {
                    value: next.to_string(),
                    expires_at: None,
                },
            );
            shared.bump(key);
            Ok(Value::Int(next))
        }
        BatchOp::Command { name, .. } => Err(LockError::UnsupportedCommand(name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_put_if_absent_is_first_writer_wins() {
        let store = MemoryStore::new();

        assert!(store
            .put_if_absent("k", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .put_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.read("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryStore::new();

        store
            .put_if_absent("k", "a", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        sleep(Duration::from_millis(60)).await;
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_detects_external_write() {
        let store = MemoryStore::new();
        store.force_set("k", "before");

        let guard = store.watch(&["k".to_string()]).await.unwrap();
        store.force_set("k", "after");

        let mut batch = CommandBatch::default();
        batch.set("k", "mine");
        assert_eq!(guard.commit(&batch).await.unwrap(), None);

        // The external write survives.
        assert_eq!(store.read("k").await.unwrap(), Some("after".to_string()));
    }

    #[tokio::test]
    async fn test_watch_commit_applies_in_order() {
        let store = MemoryStore::new();

        let guard = store.watch(&["k".to_string()]).await.unwrap();
        let mut batch = CommandBatch::default();
        batch.set("k", "v").get("k").incr("n", 2);

        let results = guard.commit(&batch).await.unwrap().unwrap();
        assert_eq!(
            results,
            vec![
                Value::Okay,
                Value::Data(b"v".to_vec()),
                Value::Int(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_expiry_counts_as_watched_change() {
        let store = MemoryStore::new();
        store
            .put_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap();

        let guard = store.watch(&["k".to_string()]).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let mut batch = CommandBatch::default();
        batch.set("other", "v");
        assert_eq!(guard.commit(&batch).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_native_commands_rejected() {
        let store = MemoryStore::new();

        let guard = store.watch(&[]).await.unwrap();
        let mut batch = CommandBatch::default();
        batch.command("GEOADD", vec!["places".into(), "13.4".into()]);

        let err = guard.commit(&batch).await.unwrap_err();
        assert!(matches!(err, LockError::UnsupportedCommand(name) if name == "GEOADD"));
    }
}

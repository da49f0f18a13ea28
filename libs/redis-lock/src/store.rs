//! Conditional-store contract and its Redis implementation.
//!
//! The lock manager and transaction runner only ever talk to the store
//! through [`ConditionalStore`]. The contract is the atomicity of each
//! primitive, not the mechanism: [`RedisStore`] realizes compare-and-act
//! with server-side Lua scripts and conditional commits with WATCH plus an
//! atomic pipeline, while [`crate::MemoryStore`] implements the same
//! contract in-process for tests.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script, Value};
use redis_utils::{RedisPool, SharedConnectionManager};

use crate::error::LockResult;
use crate::transaction::{BatchOp, CommandBatch};

// A client-side GET followed by DEL is a race: the key can be re-acquired
// by another owner between the read and the delete. Both check-and-act
// primitives run as a single server-side script instead.
static DELETE_IF_EQUAL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end
    "#,
    )
});

static REFRESH_IF_EQUAL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        else
            return 0
        end
    "#,
    )
});

/// One optimistic attempt: key versions pinned at creation, resolved by
/// exactly one call to [`commit`](WatchGuard::commit) or
/// [`abort`](WatchGuard::abort).
#[async_trait]
pub trait WatchGuard: Send {
    /// Commit the batch atomically iff no watched key changed since the
    /// watch was established. `None` signals a conflict.
    async fn commit(self: Box<Self>, batch: &CommandBatch) -> LockResult<Option<Vec<Value>>>;

    /// Clear watch state without committing.
    async fn abort(self: Box<Self>);
}

/// Atomic conditional primitives required of the backing store.
///
/// Injected at construction so that lock and transaction semantics can be
/// exercised against a fake store with the same contract.
#[async_trait]
pub trait ConditionalStore: Send + Sync {
    /// Atomic set-if-absent with expiry. True iff this call created the key.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool>;

    /// Atomic compare-and-delete. True iff the key held `expected` and was
    /// deleted.
    async fn delete_if_equal(&self, key: &str, expected: &str) -> LockResult<bool>;

    /// Atomic compare-and-re-expire. True iff the key held `expected` and
    /// its expiry was reset to `ttl` from now.
    async fn refresh_if_equal(&self, key: &str, expected: &str, ttl: Duration) -> LockResult<bool>;

    /// Plain read of a value. Advisory: state may change immediately after
    /// the call returns.
    async fn read(&self, key: &str) -> LockResult<Option<String>>;

    /// Existence check. Advisory, same caveat as [`read`](Self::read).
    async fn exists(&self, key: &str) -> LockResult<bool>;

    /// Pin the current version of `keys` and open a conditional-commit
    /// session.
    async fn watch(&self, keys: &[String]) -> LockResult<Box<dyn WatchGuard>>;
}

/// Production [`ConditionalStore`] over a shared Redis connection.
pub struct RedisStore {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisStore {
    pub fn new(client: Client, manager: SharedConnectionManager) -> Self {
        Self { client, manager }
    }

    pub fn from_pool(pool: &RedisPool) -> Self {
        Self::new(pool.client(), pool.manager())
    }

    async fn connection(&self) -> redis::aio::ConnectionManager {
        let guard = self.manager.lock().await;
        guard.clone()
    }
}

#[async_trait]
impl ConditionalStore for RedisStore {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let mut conn = self.connection().await;
        // SET key value NX PX <ttl> replies OK on creation, nil otherwise.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equal(&self, key: &str, expected: &str) -> LockResult<bool> {
        let mut conn = self.connection().await;
        let deleted: i64 = DELETE_IF_EQUAL
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn refresh_if_equal(&self, key: &str, expected: &str, ttl: Duration) -> LockResult<bool> {
        let mut conn = self.connection().await;
        let refreshed: i64 = REFRESH_IF_EQUAL
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn read(&self, key: &str) -> LockResult<Option<String>> {
        let mut conn = self.connection().await;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> LockResult<bool> {
        let mut conn = self.connection().await;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn watch(&self, keys: &[String]) -> LockResult<Box<dyn WatchGuard>> {
        // WATCH state is connection-scoped, so every session runs on its
        // own connection instead of the shared manager.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        if !keys.is_empty() {
            redis::cmd("WATCH")
                .arg(keys)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(Box::new(RedisWatchGuard { conn }))
    }
}

struct RedisWatchGuard {
    conn: MultiplexedConnection,
}

#[async_trait]
impl WatchGuard for RedisWatchGuard {
    async fn commit(mut self: Box<Self>, batch: &CommandBatch) -> LockResult<Option<Vec<Value>>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                BatchOp::Get { key } => {
                    pipe.get(key);
                }
                BatchOp::Set {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.set(key, value);
                }
                BatchOp::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(ttl.as_millis() as u64);
                }
                BatchOp::Del { key } => {
                    pipe.del(key);
                }
                BatchOp::Incr { key, delta } => {
                    pipe.incr(key, *delta);
                }
                BatchOp::Command { name, args } => {
                    pipe.cmd(name).arg(args);
                }
            }
        }

        // EXEC replies nil when a watched key changed; EXEC also clears all
        // watches on this connection, so no UNWATCH is needed afterwards.
        let reply: Option<Value> = pipe.query_async(&mut self.conn).await?;
        match reply {
            Some(Value::Bulk(values)) => Ok(Some(values)),
            Some(other) => Ok(Some(vec![other])),
            None => Ok(None),
        }
    }

    async fn abort(mut self: Box<Self>) {
        let _: Result<(), _> = redis::cmd("UNWATCH")
            .query_async::<_, ()>(&mut self.conn)
            .await;
    }
}

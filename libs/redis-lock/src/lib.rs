//! Distributed locks and optimistic transactions over a shared Redis store.
//!
//! Coordination state lives entirely in the store, so any number of
//! [`LockManager`] or [`TransactionRunner`] instances across tasks and
//! processes interoperate: there is no leader, no local cache of lock
//! state, and no affinity between the process that acquires a lock and the
//! one that releases it. Ownership is proven only by token equality,
//! checked server-side in a single atomic step; losing a race is a `false`
//! return, never an error.
//!
//! # Architecture
//!
//! ```text
//! Worker A:                             Worker B:
//!   acquire("job:42", a, 5s) ──► SET job:42 a NX PX 5000 ──► OK
//!                                      acquire("job:42", b, 5s) ──► nil
//!   ... critical section ...           wait_for("job:42", b, ...) ─ poll ─┐
//!   release("job:42", a) ──► compare-and-delete (Lua)                     │
//!                                      SET job:42 b NX PX 5000 ◄──────────┘
//! ```
//!
//! Store access goes through the [`ConditionalStore`] trait: [`RedisStore`]
//! is the production implementation, [`MemoryStore`] is an in-process fake
//! with the same contract for tests.
//!
//! # Example: mutual exclusion
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use redis_lock::{timestamp_token, LockManager, RedisStore};
//! use redis_utils::{RedisConfig, RedisPool};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = RedisPool::connect(&RedisConfig::from_env()?).await?;
//!     let store = Arc::new(RedisStore::from_pool(&pool));
//!     let locks = LockManager::new(store);
//!
//!     let token = timestamp_token();
//!     if locks.acquire("reports:daily", &token, Duration::from_secs(30)).await? {
//!         // ... single-worker critical section ...
//!         locks.release("reports:daily", &token).await?;
//!     } else {
//!         // Someone else owns this work; back off or skip.
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Example: optimistic transaction
//!
//! ```no_run
//! use std::sync::Arc;
//! use redis_lock::{RedisStore, TransactionRunner};
//! use redis_utils::{RedisConfig, RedisPool};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = RedisPool::connect(&RedisConfig::from_env()?).await?;
//!     let runner = TransactionRunner::new(Arc::new(RedisStore::from_pool(&pool)));
//!
//!     // Commits iff "counter" is unchanged between watch and commit;
//!     // retries up to 3 attempts on conflict.
//!     let results = runner
//!         .run_optimistic(
//!             &["counter".to_string()],
//!             |batch| {
//!                 batch.incr("counter", 1);
//!                 Ok(())
//!             },
//!             3,
//!         )
//!         .await?;
//!     println!("committed: {:?}", results);
//!     Ok(())
//! }
//! ```

mod error;
mod lock;
pub mod memory;
mod retry;
mod store;
mod transaction;

pub use error::{LockError, LockResult};
pub use lock::{timestamp_token, LockManager};
pub use memory::MemoryStore;
pub use store::{ConditionalStore, RedisStore, WatchGuard};
pub use transaction::{CommandBatch, TransactionRunner};

/// Raw store reply type returned by committed batches.
pub use redis::Value;

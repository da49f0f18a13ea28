//! Optimistic transactions over watched keys.
//!
//! Classic optimistic concurrency control: no lock is held while the
//! caller composes its writes, and the commit succeeds only if none of the
//! watched keys changed since the watch was established. The cost is
//! wasted work on conflict, bounded by the retry limit.

use std::sync::Arc;
use std::time::Duration;

use redis::Value;
use tracing::{debug, warn};

use crate::error::{LockError, LockResult};
use crate::retry::{until_committed, Attempt};
use crate::store::ConditionalStore;

/// A queued store mutation. Composed by the `build` callback, executed
/// all-or-nothing at commit.
#[derive(Debug, Clone)]
pub(crate) enum BatchOp {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    Incr {
        key: String,
        delta: i64,
    },
    Command {
        name: String,
        args: Vec<String>,
    },
}

/// Ordered batch of operations queued for one atomic commit.
///
/// Pure composition: nothing executes until the runner commits, and
/// results come back in append order.
#[derive(Debug, Default)]
pub struct CommandBatch {
    ops: Vec<BatchOp>,
}

impl CommandBatch {
    /// Queue a read; its value is returned in the commit results.
    pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Get { key: key.into() });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        });
        self
    }

    pub fn set_with_ttl(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn incr(&mut self, key: impl Into<String>, delta: i64) -> &mut Self {
        self.ops.push(BatchOp::Incr {
            key: key.into(),
            delta,
        });
        self
    }

    /// Queue an arbitrary store-native command.
    ///
    /// Only the Redis store executes these; the in-memory test store
    /// rejects them with [`LockError::UnsupportedCommand`].
    pub fn command(&mut self, name: impl Into<String>, args: Vec<String>) -> &mut Self {
        self.ops.push(BatchOp::Command {
            name: name.into(),
            args,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Runs batches of store mutations conditioned on a set of watched keys
/// being unchanged between watch and commit, retrying on conflict.
#[derive(Clone)]
pub struct TransactionRunner {
    store: Arc<dyn ConditionalStore>,
}

impl TransactionRunner {
    pub fn new(store: Arc<dyn ConditionalStore>) -> Self {
        Self { store }
    }

    /// Run `build`'s batch atomically iff `watched_keys` are unchanged
    /// since the watch was established, retrying on conflict up to
    /// `max_retries` attempts total (0 is treated as 1).
    ///
    /// `build` must only queue operations; it runs once per attempt and an
    /// error from it aborts immediately without retry. An empty
    /// `watched_keys` degenerates to an unconditional atomic batch, and an
    /// empty batch commits trivially with an empty result list. Exhausting
    /// the retry bound fails with [`LockError::Conflict`] naming the
    /// watched keys and attempt count.
    pub async fn run_optimistic<F>(
        &self,
        watched_keys: &[String],
        build: F,
        max_retries: u32,
    ) -> LockResult<Vec<Value>>
    where
        F: Fn(&mut CommandBatch) -> anyhow::Result<()>,
    {
        let outcome = until_committed(max_retries, |attempt| {
            let store = &self.store;
            let build = &build;
            async move {
                let guard = store.watch(watched_keys).await?;

                let mut batch = CommandBatch::default();
                if let Err(err) = build(&mut batch) {
                    guard.abort().await;
                    return Err(LockError::BatchBuild(err));
                }

                match guard.commit(&batch).await? {
                    Some(results) => {
                        debug!(
                            keys = ?watched_keys,
                            attempt,
                            ops = results.len(),
                            "Optimistic batch committed"
                        );
                        Ok(Attempt::Committed(results))
                    }
                    None => {
                        debug!(keys = ?watched_keys, attempt, "Watched key changed, retrying");
                        Ok(Attempt::Conflicted)
                    }
                }
            }
        })
        .await?;

        outcome.ok_or_else(|| {
            let attempts = max_retries.max(1);
            warn!(keys = ?watched_keys, attempts, "Optimistic transaction retries exhausted");
            LockError::Conflict {
                keys: watched_keys.to_vec(),
                attempts,
            }
        })
    }
}

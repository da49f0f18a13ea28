//! Shared Redis connection bootstrap.
//!
//! Every crate in this workspace reaches Redis through a [`RedisPool`]
//! built here: configuration comes from environment variables, the initial
//! connection is retried on a fixed backoff for a bounded number of
//! attempts, and the resulting [`ConnectionManager`] is shared behind a
//! Tokio mutex.
//!
//! # Example
//!
//! ```no_run
//! use redis_utils::{RedisConfig, RedisPool};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RedisConfig::from_env()?;
//!     let pool = RedisPool::connect(&config).await?;
//!
//!     let manager = pool.manager();
//!     let mut conn = manager.lock().await.clone();
//!     redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
//!     Ok(())
//! }
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_RETRIES: u32 = 5;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Redis connection settings, usually read from the environment.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Connection string, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Total connect attempts before giving up.
    pub connect_retries: u32,
    /// Fixed delay between connect attempts.
    pub retry_backoff: Duration,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Read `REDIS_URL`, `REDIS_CONNECT_TIMEOUT_MS`, `REDIS_CONNECT_RETRIES`
    /// and `REDIS_CONNECT_BACKOFF_MS`, falling back to defaults for any
    /// variable that is unset.
    pub fn from_env() -> Result<Self> {
        let url = env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        let mut config = Self::new(url);

        if let Some(connect_timeout) = duration_ms_var("REDIS_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = connect_timeout;
        }
        if let Some(connect_retries) = u32_var("REDIS_CONNECT_RETRIES")? {
            config.connect_retries = connect_retries;
        }
        if let Some(retry_backoff) = duration_ms_var("REDIS_CONNECT_BACKOFF_MS")? {
            config.retry_backoff = retry_backoff;
        }

        Ok(config)
    }
}

fn duration_ms_var(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("{} must be an integer millisecond value", name))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

fn u32_var(name: &str) -> Result<Option<u32>> {
    match env::var(name) {
        Ok(raw) => {
            let value: u32 = raw
                .parse()
                .with_context(|| format!("{} must be a non-negative integer", name))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

/// Redis connection pool shared across the workspace.
pub struct RedisPool {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisPool {
    /// Connect with the configured bounded retry policy.
    ///
    /// Each failed attempt is logged and retried after `retry_backoff`;
    /// once `connect_retries` attempts are exhausted the last error is
    /// surfaced to the caller.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .context("failed to parse Redis connection string")?;

        let attempts = config.connect_retries.max(1);
        let mut attempt = 0u32;
        let manager = loop {
            attempt += 1;
            match timeout(config.connect_timeout, ConnectionManager::new(client.clone())).await {
                Ok(Ok(manager)) => break manager,
                Ok(Err(err)) => {
                    if attempt >= attempts {
                        return Err(err).with_context(|| {
                            format!("failed to connect to Redis after {} attempts", attempt)
                        });
                    }
                    warn!(attempt, error = %err, "Redis connection failed, retrying");
                }
                Err(_) => {
                    if attempt >= attempts {
                        bail!(
                            "timed out connecting to Redis after {} attempts of {}ms",
                            attempt,
                            config.connect_timeout.as_millis()
                        );
                    }
                    warn!(
                        attempt,
                        timeout_ms = config.connect_timeout.as_millis() as u64,
                        "Redis connection attempt timed out, retrying"
                    );
                }
            }
            sleep(config.retry_backoff).await;
        };

        info!(url = %config.url, "Redis connection established");

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    /// Client handle for callers that need a dedicated connection.
    ///
    /// Connection-scoped state such as WATCH does not survive sharing the
    /// multiplexed manager, so transactional callers open their own
    /// connection from this client.
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

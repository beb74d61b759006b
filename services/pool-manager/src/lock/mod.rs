//! Per-scope mutual exclusion.
//!
//! Every apply call for a `(cloud, resource type, business)` scope runs under
//! one short-lived lease. The lease is a key in a shared backend whose value
//! is a random [`LockToken`]; only the holder of that token may release it,
//! and the backend expires it after the configured TTL if the holder dies.

pub mod memory;
pub mod redis;

pub use memory::MemoryLockBackend;
pub use self::redis::RedisLockBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use respool_id::LockToken;
use respool_retry::{RetryError, RetryPolicy};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Scope;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the key.
    #[error("lock '{key}' is held by another request")]
    Busy { key: String },

    /// The retry budget ran out while the key stayed held.
    #[error("timed out acquiring lock '{key}' after {attempts} attempts")]
    Timeout { key: String, attempts: u32 },

    /// The lock backend failed.
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for LockError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Key/value primitive a lease is built on.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` with `ttl` unless the key exists.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> LockResult<bool>;

    /// Delete `key` only if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> LockResult<bool>;

    async fn ping(&self) -> LockResult<()>;
}

/// Lease timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Backend expiry of an unreleased lease.
    pub ttl: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_attempts: 30,
            retry_delay: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(50),
        }
    }
}

/// A held scope lease. Hand it back to [`ScopeLocker::release`].
#[derive(Debug)]
#[must_use = "a lease blocks its scope until released or expired"]
pub struct ScopeLease {
    key: String,
    token: LockToken,
}

impl ScopeLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> LockToken {
        self.token
    }
}

/// Acquires and releases scope leases against a [`LockBackend`].
#[derive(Clone)]
pub struct ScopeLocker {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl ScopeLocker {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Spin until the scope's key is ours or the attempt budget is spent.
    pub async fn acquire(&self, scope: &Scope) -> LockResult<ScopeLease> {
        let key = scope.lock_key();
        let token = LockToken::new();
        let value = token.to_string();
        let policy = RetryPolicy::fixed(
            self.config.max_attempts,
            self.config.retry_delay,
            self.config.retry_jitter,
        );

        let result = policy
            .retry_if(
                |_attempt| self.try_once(&key, &value),
                |err| matches!(err, LockError::Busy { .. } | LockError::Backend(_)),
            )
            .await;

        match result {
            Ok(()) => {
                debug!(key = %key, token = %token, "Scope lock acquired");
                Ok(ScopeLease { key, token })
            }
            Err(RetryError::Exhausted {
                attempts,
                last: LockError::Busy { .. },
            }) => {
                warn!(key = %key, attempts, "Scope lock acquisition timed out");
                Err(LockError::Timeout { key, attempts })
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Release a lease. Returns `false` if it had already expired.
    pub async fn release(&self, lease: ScopeLease) -> LockResult<bool> {
        let released = self
            .backend
            .release(&lease.key, &lease.token.to_string())
            .await?;
        if released {
            debug!(key = %lease.key, "Scope lock released");
        } else {
            warn!(key = %lease.key, "Scope lock expired before release");
        }
        Ok(released)
    }

    pub async fn ping(&self) -> LockResult<()> {
        self.backend.ping().await
    }

    async fn try_once(&self, key: &str, value: &str) -> LockResult<()> {
        if self.backend.try_acquire(key, value, self.config.ttl).await? {
            Ok(())
        } else {
            Err(LockError::Busy {
                key: key.to_string(),
            })
        }
    }
}

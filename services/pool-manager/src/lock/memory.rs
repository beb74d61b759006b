//! Process-local lock backend for tests and single-node development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LockBackend, LockResult};

#[derive(Clone, Default)]
pub struct MemoryLockBackend {
    keys: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, ignoring expired entries.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let keys = self.keys.lock().await;
        keys.get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> LockResult<bool> {
        let mut keys = self.keys.lock().await;
        let now = Instant::now();
        if keys.get(key).is_some_and(|(_, expires_at)| *expires_at > now) {
            return Ok(false);
        }
        keys.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let mut keys = self.keys.lock().await;
        let owned = keys
            .get(key)
            .is_some_and(|(held, expires_at)| held == token && *expires_at > Instant::now());
        if owned {
            keys.remove(key);
        }
        Ok(owned)
    }

    async fn ping(&self) -> LockResult<()> {
        Ok(())
    }
}

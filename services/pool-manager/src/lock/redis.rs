//! Redis lock backend: `SET key token NX PX ttl` to take a lease and a
//! compare-and-delete script to give it back.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use super::{LockBackend, LockResult};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockBackend {
    manager: ConnectionManager,
    release_script: Script,
}

impl RedisLockBackend {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/`).
    pub async fn connect(url: &str) -> LockResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected to redis lock backend");

        Ok(Self {
            manager,
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> LockResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> LockResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

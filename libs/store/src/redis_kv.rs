//! Redis backend.
//!
//! Entries are written with a single `MSET`, so the content and metadata
//! keys of a blob appear together or not at all.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::error::Result;
use crate::kv::KvBackend;

/// KV backend on a Redis server. The connection is multiplexed between
/// request tasks and re-established after failures.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

impl RedisKv {
    /// Connects to `url`, e.g. `redis://cache:6379/0`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to redis content store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn set_many(&self, entries: Vec<(String, Bytes)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let items: Vec<(String, Vec<u8>)> = entries
            .into_iter()
            .map(|(key, value)| (key, value.to_vec()))
            .collect();
        let mut conn = self.conn.clone();
        conn.mset::<String, Vec<u8>, ()>(&items).await?;
        Ok(())
    }
}

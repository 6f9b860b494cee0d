//! Key-value backend.
//!
//! Each entry occupies two keys, `cs:content:{digest}` and `cs:info:{digest}`,
//! which a backend must write in one operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use parking_lot::RwLock;
use regfac_oci::Digest;

use crate::error::{Result, StoreError};
use crate::{BlobInfo, BlobReader};

/// Minimal KV surface the content store needs.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Writes all entries atomically.
    async fn set_many(&self, entries: Vec<(String, Bytes)>) -> Result<()>;
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryKv {
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn set_many(&self, entries: Vec<(String, Bytes)>) -> Result<()> {
        let mut map = self.entries.write();
        map.extend(entries);
        Ok(())
    }
}

#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}

fn content_key(digest: &Digest) -> String {
    format!("cs:content:{digest}")
}

fn info_key(digest: &Digest) -> String {
    format!("cs:info:{digest}")
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub(crate) async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.backend.exists(&content_key(digest)).await?
            && self.backend.exists(&info_key(digest)).await?)
    }

    pub(crate) async fn info(&self, digest: &Digest) -> Result<BlobInfo> {
        let data = self
            .backend
            .get(&info_key(digest))
            .await?
            .ok_or_else(|| StoreError::NotFound(digest.clone()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub(crate) async fn reader_at(&self, digest: &Digest) -> Result<BlobReader> {
        let data = self
            .backend
            .get(&content_key(digest))
            .await?
            .ok_or_else(|| StoreError::NotFound(digest.clone()))?;
        Ok(BlobReader {
            size: data.len() as u64,
            stream: stream::once(async move { Ok(data) }).boxed(),
        })
    }

    pub(crate) async fn put(&self, info: &BlobInfo, data: Bytes) -> Result<()> {
        let meta = Bytes::from(serde_json::to_vec(info)?);
        self.backend
            .set_many(vec![
                (content_key(&info.digest), data),
                (info_key(&info.digest), meta),
            ])
            .await
    }
}

//! # regfac-store
//!
//! Content-addressed storage for manifests, configs and synthesized blobs,
//! kept on local disk, in Redis or in memory.
//!
//! Every entry consists of two keys: the content itself and a [`BlobInfo`]
//! metadata record. An entry counts as present only when both exist.
//!
//! The key of an entry is the digest of the descriptor it was written for,
//! which is usually but not necessarily the digest of the stored bytes: the
//! manifest pipeline stores a resolved manifest under the digest of the index
//! that pointed to it.
//!
//! Writes go through a [`StoreWriter`], which buffers everything and only
//! touches the backend on [`StoreWriter::commit`]. This is meant for small
//! blobs; image layers are never written here.

mod error;
mod kv;
mod local;
mod redis_kv;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use regfac_oci::{Descriptor, Digest};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::{Result, StoreError};
pub use kv::{KvBackend, KvStore, MemoryKv};
pub use local::LocalStore;
pub use redis_kv::RedisKv;

/// Label recording the media type of the descriptor an entry was written for.
pub const LABEL_MEDIA_TYPE: &str = "registry-facade.media-type";

/// Metadata stored next to every blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl BlobInfo {
    pub fn media_type(&self) -> Option<&str> {
        self.labels.get(LABEL_MEDIA_TYPE).map(String::as_str)
    }
}

/// Streaming view of stored content.
pub struct BlobReader {
    pub size: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

impl BlobReader {
    /// Collects the whole blob into memory.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        let chunks: Vec<Bytes> = self.stream.try_collect().await?;
        Ok(match chunks.len() {
            1 => chunks.into_iter().next().unwrap_or_default(),
            _ => Bytes::from(chunks.concat()),
        })
    }
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader").field("size", &self.size).finish()
    }
}

/// Content store backends.
#[derive(Debug, Clone)]
pub enum ContentStore {
    /// Files under a local directory.
    Local(LocalStore),
    /// A key-value service such as Redis, or the in-process map.
    Kv(KvStore),
}

impl ContentStore {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::Local(LocalStore::new(root))
    }

    /// An in-process store, lost on restart.
    pub fn memory() -> Self {
        Self::Kv(KvStore::new(Arc::new(MemoryKv::default())))
    }

    pub fn kv(backend: Arc<dyn KvBackend>) -> Self {
        Self::Kv(KvStore::new(backend))
    }

    /// A store on the Redis server at `url`.
    pub async fn redis(url: &str) -> Result<Self> {
        Ok(Self::kv(Arc::new(RedisKv::connect(url).await?)))
    }

    /// Metadata for the entry stored under `digest`.
    pub async fn info(&self, digest: &Digest) -> Result<BlobInfo> {
        match self {
            Self::Local(s) => s.info(digest).await,
            Self::Kv(s) => s.info(digest).await,
        }
    }

    /// Opens the content stored under `desc.digest`.
    pub async fn reader_at(&self, desc: &Descriptor) -> Result<BlobReader> {
        match self {
            Self::Local(s) => s.reader_at(&desc.digest).await,
            Self::Kv(s) => s.reader_at(&desc.digest).await,
        }
    }

    /// Reads the content stored under `desc.digest` into memory.
    pub async fn read_all(&self, desc: &Descriptor) -> Result<Bytes> {
        let reader = self.reader_at(desc).await?;
        Ok(reader.into_bytes().await?)
    }

    /// Starts a buffered write keyed by `desc.digest`.
    pub fn writer(&self, desc: &Descriptor) -> StoreWriter {
        StoreWriter {
            store: self.clone(),
            key: desc.digest.clone(),
            media_type: desc.media_type.clone(),
            buf: Vec::new(),
        }
    }

    /// Both content and metadata exist for `digest`.
    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        match self {
            Self::Local(s) => s.exists(digest).await,
            Self::Kv(s) => s.exists(digest).await,
        }
    }

    async fn put(&self, info: &BlobInfo, data: Bytes) -> Result<()> {
        match self {
            Self::Local(s) => s.put(info, data).await,
            Self::Kv(s) => s.put(info, data).await,
        }
    }
}

/// Buffers content until [`commit`](Self::commit).
#[derive(Debug)]
pub struct StoreWriter {
    store: ContentStore,
    key: Digest,
    media_type: String,
    buf: Vec<u8>,
}

impl StoreWriter {
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn written(&self) -> usize {
        self.buf.len()
    }

    /// Persists the buffered bytes.
    ///
    /// When `expected` is given, the buffered bytes must hash to it or
    /// nothing is stored. Committing over an existing entry is a no-op.
    pub async fn commit(
        self,
        expected: Option<&Digest>,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let data = Bytes::from(self.buf);

        if let Some(expected) = expected {
            let actual = expected.rehash(&data);
            if &actual != expected {
                return Err(StoreError::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if self.store.exists(&self.key).await? {
            debug!(digest = %self.key, "content already stored");
            return Ok(());
        }

        let mut labels = labels;
        labels
            .entry(LABEL_MEDIA_TYPE.to_string())
            .or_insert(self.media_type);

        let now = Utc::now();
        let info = BlobInfo {
            digest: self.key,
            size: data.len() as u64,
            created_at: now,
            updated_at: now,
            labels,
        };
        self.store.put(&info, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regfac_oci::media_types;

    fn stores() -> Vec<(ContentStore, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        vec![
            (ContentStore::local(dir.path()), Some(dir)),
            (ContentStore::memory(), None),
        ]
    }

    #[tokio::test]
    async fn test_commit_then_read() {
        for (store, _dir) in stores() {
            let desc = Descriptor::for_bytes(media_types::OCI_CONFIG, b"{}");
            let mut w = store.writer(&desc);
            w.write(b"{");
            w.write(b"}");
            assert_eq!(w.written(), 2);
            w.commit(Some(&desc.digest), BTreeMap::new()).await.unwrap();

            assert_eq!(store.read_all(&desc).await.unwrap(), Bytes::from_static(b"{}"));
            let info = store.info(&desc.digest).await.unwrap();
            assert_eq!(info.size, 2);
            assert_eq!(info.media_type(), Some(media_types::OCI_CONFIG));
        }
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        for (store, _dir) in stores() {
            let desc = Descriptor::for_bytes(media_types::OCI_LAYER, b"layer");
            for _ in 0..2 {
                let mut w = store.writer(&desc);
                w.write(b"layer");
                w.commit(Some(&desc.digest), BTreeMap::new()).await.unwrap();
            }
            assert_eq!(
                store.read_all(&desc).await.unwrap(),
                Bytes::from_static(b"layer")
            );
        }
    }

    #[tokio::test]
    async fn test_mismatch_stores_nothing() {
        for (store, _dir) in stores() {
            let desc = Descriptor::for_bytes(media_types::OCI_LAYER, b"expected");
            let mut w = store.writer(&desc);
            w.write(b"something else");
            let err = w
                .commit(Some(&desc.digest), BTreeMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::DigestMismatch { .. }));

            assert!(!store.exists(&desc.digest).await.unwrap());
            assert!(store.info(&desc.digest).await.unwrap_err().is_not_found());
            assert!(store.reader_at(&desc).await.unwrap_err().is_not_found());
        }
    }

    #[tokio::test]
    async fn test_expected_digest_in_other_algorithm() {
        for (store, _dir) in stores() {
            let desc = Descriptor::for_bytes(media_types::OCI_LAYER, b"layer");
            let sha512 = Digest::parse(&format!("sha512:{}", "0".repeat(128))).unwrap();
            let expected = sha512.rehash(b"layer");
            assert_eq!(expected.algorithm(), Digest::SHA512);

            let mut w = store.writer(&desc);
            w.write(b"layer");
            w.commit(Some(&expected), BTreeMap::new()).await.unwrap();
            assert!(store.exists(&desc.digest).await.unwrap());

            let other = Descriptor::for_bytes(media_types::OCI_LAYER, b"other");
            let mut w = store.writer(&other);
            w.write(b"other");
            let err = w.commit(Some(&expected), BTreeMap::new()).await.unwrap_err();
            assert!(matches!(err, StoreError::DigestMismatch { .. }));
            assert!(!store.exists(&other.digest).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_key_may_differ_from_content_digest() {
        for (store, _dir) in stores() {
            let index = Descriptor::for_bytes(media_types::OCI_INDEX, b"index");
            let inner = Digest::from_bytes(b"manifest");

            let mut w = store.writer(&index);
            w.write(b"manifest");
            w.commit(Some(&inner), BTreeMap::new()).await.unwrap();

            assert_eq!(
                store.read_all(&index).await.unwrap(),
                Bytes::from_static(b"manifest")
            );
            assert!(!store.exists(&inner).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_caller_labels_are_kept() {
        let store = ContentStore::memory();
        let desc = Descriptor::for_bytes(media_types::OCI_LAYER, b"x");
        let mut w = store.writer(&desc);
        w.write(b"x");
        let labels = BTreeMap::from([("origin".to_string(), "test".to_string())]);
        w.commit(None, labels).await.unwrap();

        let info = store.info(&desc.digest).await.unwrap();
        assert_eq!(info.labels.get("origin").map(String::as_str), Some("test"));
        assert_eq!(info.media_type(), Some(media_types::OCI_LAYER));
    }
}

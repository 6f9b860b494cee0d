//! Local-disk backend.
//!
//! ```text
//! {root}/blobs/{algorithm}/{hex}
//! {root}/info/{algorithm}/{hex}.json
//! ```

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::StreamExt;
use regfac_oci::Digest;
use tokio_util::io::ReaderStream;

use crate::error::{Result, StoreError};
use crate::{BlobInfo, BlobReader};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    fn info_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("info")
            .join(digest.algorithm())
            .join(format!("{}.json", digest.encoded()))
    }

    pub(crate) async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?
            && tokio::fs::try_exists(self.info_path(digest)).await?)
    }

    pub(crate) async fn info(&self, digest: &Digest) -> Result<BlobInfo> {
        let data = tokio::fs::read(self.info_path(digest))
            .await
            .map_err(|e| not_found_or(e, digest))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub(crate) async fn reader_at(&self, digest: &Digest) -> Result<BlobReader> {
        let file = tokio::fs::File::open(self.blob_path(digest))
            .await
            .map_err(|e| not_found_or(e, digest))?;
        let size = file.metadata().await?.len();
        Ok(BlobReader {
            size,
            stream: ReaderStream::new(file).boxed(),
        })
    }

    /// Writes content first, then metadata; an entry without metadata is
    /// invisible to [`exists`](Self::exists) and gets overwritten by the
    /// next commit.
    pub(crate) async fn put(&self, info: &BlobInfo, data: Bytes) -> Result<()> {
        write_atomic(&self.blob_path(&info.digest), &data).await?;
        let meta = serde_json::to_vec(info)?;
        write_atomic(&self.info_path(&info.digest), &meta).await?;
        Ok(())
    }
}

fn not_found_or(err: io::Error, digest: &Digest) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(digest.clone())
    } else {
        StoreError::Io(err)
    }
}

/// Writes to a uniquely named temporary file next to `path`, then renames.
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
    if let Err(e) = tokio::fs::write(&temp_path, data).await {
        tokio::fs::remove_file(&temp_path).await.ok();
        return Err(e);
    }
    tokio::fs::rename(&temp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let store = LocalStore::new("/var/lib/rf");
        let d = Digest::from_bytes(b"");
        assert_eq!(
            store.blob_path(&d),
            PathBuf::from(format!("/var/lib/rf/blobs/sha256/{}", d.encoded()))
        );
        assert_eq!(
            store.info_path(&d),
            PathBuf::from(format!("/var/lib/rf/info/sha256/{}.json", d.encoded()))
        );
    }

    #[tokio::test]
    async fn test_blob_without_info_is_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let d = Digest::from_bytes(b"partial");
        write_atomic(&store.blob_path(&d), b"partial").await.unwrap();
        assert!(!store.exists(&d).await.unwrap());
    }
}

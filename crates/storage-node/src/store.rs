//! Blob storage: one file per file id, written at exact offsets.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::StorageError;

/// Writes chunks to disk at exact offsets with durable acks.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the base directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `data` at `offset` in the blob for `file_id` and syncs it to
    /// disk. The registry offset must only advance after this returns.
    pub async fn write_at(
        &self,
        file_id: &str,
        offset: i64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.blob_path(file_id)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset as u64)).await?;
        file.write_all(data).await?;
        // The ack must mean "durable", not "in the page cache".
        file.sync_data().await?;
        Ok(())
    }

    /// Returns the blob length in bytes, or 0 if the blob does not exist.
    ///
    /// This is the recovery path for sessions the registry no longer holds:
    /// the blob length is the highest contiguous offset ever synced.
    pub async fn len(&self, file_id: &str) -> Result<i64, StorageError> {
        let path = self.blob_path(file_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len() as i64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the blob for `file_id`. Missing blobs are not an error.
    pub async fn remove(&self, file_id: &str) -> Result<(), StorageError> {
        let path = self.blob_path(file_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Validates the file id and joins it under the root.
    ///
    /// File ids are single path components (the master allocates UUIDs);
    /// anything that could traverse out of the root is rejected.
    fn blob_path(&self, file_id: &str) -> Result<PathBuf, StorageError> {
        if file_id.is_empty()
            || file_id == "."
            || file_id == ".."
            || file_id.contains('/')
            || file_id.contains('\\')
            || file_id.contains('\0')
        {
            return Err(StorageError::InvalidFileId(file_id.to_string()));
        }
        Ok(self.root.join(file_id))
    }
}

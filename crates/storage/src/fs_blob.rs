//! Filesystem blob store: one file per fingerprint under
//! `<root>/<job_id>/`. Bodies stream into a `.part` file that is renamed
//! into place on close, so readers never observe a truncated blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use trawler_core::CrawlError;

use crate::{BlobStore, BlobWriter};

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn io_err(e: std::io::Error) -> CrawlError {
        CrawlError::Storage(e.to_string())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open_writer(
        &self,
        job_id: &str,
        fingerprint: &str,
    ) -> Result<Box<dyn BlobWriter>, CrawlError> {
        let dir = self.root.join(job_id);
        fs::create_dir_all(&dir).await.map_err(Self::io_err)?;

        let content_ref = format!("{job_id}/{fingerprint}.bin");
        let final_path = dir.join(format!("{fingerprint}.bin"));
        let part_path = dir.join(format!("{fingerprint}.bin.part"));
        let file = fs::File::create(&part_path).await.map_err(Self::io_err)?;

        Ok(Box::new(FsBlobWriter {
            file,
            part_path,
            final_path,
            content_ref,
        }))
    }

    async fn read(&self, content_ref: &str) -> Result<Vec<u8>, CrawlError> {
        // content_refs are produced by this store; reject anything that
        // escapes the root.
        if content_ref.contains("..") || Path::new(content_ref).is_absolute() {
            return Err(CrawlError::Storage(format!(
                "bad content_ref: {content_ref}"
            )));
        }
        fs::read(self.root.join(content_ref))
            .await
            .map_err(Self::io_err)
    }
}

struct FsBlobWriter {
    file: fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
    content_ref: String,
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CrawlError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(FsBlobStore::io_err)
    }

    async fn close(mut self: Box<Self>) -> Result<String, CrawlError> {
        self.file.flush().await.map_err(FsBlobStore::io_err)?;
        drop(self.file);
        fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(FsBlobStore::io_err)?;
        Ok(self.content_ref)
    }

    async fn discard(self: Box<Self>) -> Result<(), CrawlError> {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.part_path).await {
            debug!(path = %self.part_path.display(), "discard of partial blob failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_close_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let mut writer = store.open_writer("job-1", "abcd").await.unwrap();
        writer.write_chunk(b"hello ").await.unwrap();
        writer.write_chunk(b"world").await.unwrap();
        let content_ref = writer.close().await.unwrap();
        assert_eq!(content_ref, "job-1/abcd.bin");

        let body = store.read(&content_ref).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn discard_leaves_no_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let mut writer = store.open_writer("job-1", "abcd").await.unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        writer.discard().await.unwrap();

        assert!(store.read("job-1/abcd.bin").await.is_err());
        assert!(!dir.path().join("job-1/abcd.bin.part").exists());
    }

    #[tokio::test]
    async fn rejects_traversal_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.read("../etc/passwd").await.is_err());
        assert!(store.read("/etc/passwd").await.is_err());
    }
}

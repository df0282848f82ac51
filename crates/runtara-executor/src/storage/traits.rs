// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage device trait definitions.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Size of one transfer range.
pub const TRANSFER_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors from storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The path does not exist.
    #[error("File not found: {0}")]
    NotFound(String),

    /// The remote service rejected the request.
    #[error("Storage request failed with status {status}: {body}")]
    Remote {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Storage configuration is invalid.
    #[error("Invalid storage configuration: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A response body was not well-formed XML.
    #[error("Invalid XML response: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Progress of a chunked upload, carried between [`StorageDevice::upload_chunk`] calls.
#[derive(Debug, Clone, Default)]
pub struct UploadState {
    /// Remote multipart upload ID, once started
    pub upload_id: Option<String>,
    /// `(part number, etag)` of each uploaded part
    pub parts: Vec<(u32, String)>,
}

/// A pluggable blob storage backend.
///
/// Build and execution code depends on this trait only; the concrete device
/// is chosen from configuration.
#[async_trait]
pub trait StorageDevice: Send + Sync {
    /// Device type identifier (e.g., "local", "s3")
    fn device_type(&self) -> &'static str;

    /// Root every [`StorageDevice::get_path`] result lives under.
    fn root(&self) -> &str;

    /// Full path of `filename` under the device root.
    fn get_path(&self, filename: &str) -> String {
        format!("{}/{}", self.root().trim_end_matches('/'), filename)
    }

    /// Whether `path` exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Size of `path` in bytes.
    async fn file_size(&self, path: &str) -> Result<u64>;

    /// Create directory `path` and its parents.
    async fn create_directory(&self, path: &str) -> Result<()>;

    /// Delete `path` and anything below it. Deleting an absent path succeeds.
    async fn delete_path(&self, path: &str) -> Result<()>;

    /// Paths of all files under `prefix`.
    async fn get_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read `length` bytes of `path` starting at `offset`.
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Write chunk `chunk` (1-based) of `chunks` to `path`.
    async fn upload_chunk(
        &self,
        path: &str,
        data: Bytes,
        chunk: u32,
        chunks: u32,
        state: &mut UploadState,
    ) -> Result<()>;

    /// Copy `source` on this device to `destination` on `target`.
    async fn transfer(
        &self,
        source: &str,
        destination: &str,
        target: &dyn StorageDevice,
    ) -> Result<()> {
        let size = self.file_size(source).await?;
        let chunks = size.div_ceil(TRANSFER_CHUNK_SIZE).max(1) as u32;
        let mut state = UploadState::default();

        for chunk in 1..=chunks {
            let offset = u64::from(chunk - 1) * TRANSFER_CHUNK_SIZE;
            let length = TRANSFER_CHUNK_SIZE.min(size - offset);
            let data = self.read_range(source, offset, length).await?;
            target
                .upload_chunk(destination, data, chunk, chunks, &mut state)
                .await?;
        }

        tracing::debug!(
            source,
            destination,
            size,
            chunks,
            from = self.device_type(),
            to = target.device_type(),
            "Transferred file"
        );
        Ok(())
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local filesystem storage device.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::traits::*;

/// Storage device on the local filesystem. Paths are filesystem paths.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    root: String,
}

impl LocalDevice {
    /// Device rooted at `root`.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

fn not_found(path: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl StorageDevice for LocalDevice {
    fn device_type(&self) -> &'static str {
        "local"
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(metadata.len())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let result = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(StorageError::Io)
    }

    async fn get_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![prefix.to_string()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path().to_string_lossy().into_owned();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| not_found(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(length as usize);
        file.take(length).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn upload_chunk(
        &self,
        path: &str,
        data: Bytes,
        chunk: u32,
        _chunks: u32,
        _state: &mut UploadState,
    ) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(chunk == 1)
            .append(chunk > 1)
            .open(path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

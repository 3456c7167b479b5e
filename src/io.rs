//! File abstraction for block files and text descriptors
//!
//! [`DataFile`] does blocking positioned I/O. It only runs on the disk
//! worker thread or on tokio's blocking pool.

use crate::error::{IdxError, Result};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Access mode of an open [`DataFile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    ReadWrite,
}

/// A block file opened for positioned reads and writes
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
    mode: FileMode,
}

impl DataFile {
    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, mode: FileMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(mode == FileMode::ReadWrite)
            .open(&path)
            .map_err(|_| IdxError::CannotOpen(path.display().to_string()))?;
        Ok(Self { path, file, mode })
    }

    /// Create a new file, failing if it already exists. Parent directories are created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| IdxError::CannotOpen(path.display().to_string()))?;
        Ok(Self {
            path,
            file,
            mode: FileMode::ReadWrite,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn can_write(&self) -> bool {
        self.mode == FileMode::ReadWrite
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.can_write() {
            return Err(IdxError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path.display()),
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Strip a `file://` scheme
pub fn local_path(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

/// Read a text descriptor from a local path or `file://` URL
pub async fn load_text_document(url: &str) -> Result<String> {
    if url.contains("://") && !url.starts_with("file://") {
        return Err(IdxError::Unsupported(format!(
            "only local descriptors can be loaded, got '{}'",
            url
        )));
    }
    let path = local_path(url);
    let content = fs::read_to_string(path)
        .await
        .map_err(|_| IdxError::CannotOpen(path.to_string()))?;
    if content.trim().is_empty() {
        return Err(IdxError::InvalidFormat(format!("empty content in '{}'", path)));
    }
    Ok(content)
}

/// Write a text descriptor, creating parent directories
pub async fn save_text_document(path: impl AsRef<Path>, content: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

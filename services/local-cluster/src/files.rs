//! Shared static-file registry.
//!
//! Actors publish host directories or files under virtual paths (a worker
//! publishes its work directory) and readers browse or page through them
//! without knowing where they live on disk. One registry is shared by the
//! coordinator and every worker for the lifetime of a cluster.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

#[derive(Debug, Error)]
pub enum FilesError {
    #[error("nothing attached at '{0}'")]
    NotFound(String),

    #[error("invalid virtual path '{0}'")]
    InvalidPath(String),

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("'{0}' is a directory")]
    IsADirectory(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A page of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u64,
    pub data: Vec<u8>,
    /// Total file size at the time of the read.
    pub size: u64,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Registry of virtual path → host path attachments.
#[derive(Debug, Default)]
pub struct FileRegistry {
    attached: RwLock<BTreeMap<String, PathBuf>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `host_path` under `virtual_path`. The host path must exist.
    ///
    /// Re-attaching a virtual path replaces the previous attachment.
    pub async fn attach(
        &self,
        host_path: impl AsRef<Path>,
        virtual_path: &str,
    ) -> Result<(), FilesError> {
        let host_path = host_path.as_ref();
        let virtual_path = normalize(virtual_path)?;
        tokio::fs::metadata(host_path).await?;

        debug!(virtual_path = %virtual_path, host_path = %host_path.display(), "Attached path");
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(virtual_path, host_path.to_path_buf());
        Ok(())
    }

    /// Remove an attachment. Returns false if nothing was attached.
    pub fn detach(&self, virtual_path: &str) -> bool {
        let Ok(virtual_path) = normalize(virtual_path) else {
            return false;
        };
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&virtual_path)
            .is_some()
    }

    /// Currently attached virtual paths, sorted.
    pub fn attached(&self) -> Vec<String> {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Reading past the end returns an empty chunk with the real size.
    pub async fn read(
        &self,
        virtual_path: &str,
        offset: u64,
        length: usize,
    ) -> Result<FileChunk, FilesError> {
        let host_path = self.resolve(virtual_path)?;
        let metadata = tokio::fs::metadata(&host_path).await?;
        if metadata.is_dir() {
            return Err(FilesError::IsADirectory(virtual_path.to_string()));
        }

        let size = metadata.len();
        if offset >= size {
            return Ok(FileChunk {
                offset,
                data: Vec::new(),
                size,
            });
        }

        let mut file = tokio::fs::File::open(&host_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let to_read = length.min((size - offset) as usize);
        let mut data = vec![0u8; to_read];
        let mut filled = 0;
        while filled < to_read {
            let n = file.read(&mut data[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);

        Ok(FileChunk { offset, data, size })
    }

    /// List a directory, sorted by name.
    pub async fn browse(&self, virtual_path: &str) -> Result<Vec<FileInfo>, FilesError> {
        let base = normalize(virtual_path)?;
        let host_path = self.resolve(&base)?;
        if !tokio::fs::metadata(&host_path).await?.is_dir() {
            return Err(FilesError::NotADirectory(base));
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&host_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(FileInfo {
                path: format!("{}/{}", base.trim_end_matches('/'), entry.file_name().to_string_lossy()),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Map a virtual path onto the host via its longest attached prefix.
    fn resolve(&self, virtual_path: &str) -> Result<PathBuf, FilesError> {
        let virtual_path = normalize(virtual_path)?;
        let attached = self.attached.read().unwrap_or_else(PoisonError::into_inner);

        let mut candidate = virtual_path.as_str();
        loop {
            if let Some(host) = attached.get(candidate) {
                let rest = virtual_path[candidate.len()..].trim_start_matches('/');
                return Ok(if rest.is_empty() {
                    host.clone()
                } else {
                    host.join(rest)
                });
            }
            if candidate == "/" {
                break;
            }
            candidate = match candidate.rfind('/') {
                Some(0) => "/",
                Some(idx) => &candidate[..idx],
                None => break,
            };
        }

        Err(FilesError::NotFound(virtual_path))
    }
}

/// Canonical virtual path: leading `/`, no empty, `.` or `..` segments,
/// no trailing `/`.
fn normalize(virtual_path: &str) -> Result<String, FilesError> {
    let mut out = String::new();
    for component in Path::new(virtual_path).components() {
        match component {
            Component::RootDir => {}
            Component::CurDir => {}
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::ParentDir | Component::Prefix(_) => {
                return Err(FilesError::InvalidPath(virtual_path.to_string()));
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

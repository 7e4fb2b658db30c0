//! Recordings on a mounted share or local disk.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::source::{RemoteFile, RemoteReader, RemoteSource, Result, SourceError};

pub struct DirectorySource {
    root: PathBuf,
    chunk_size: usize,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

struct FileReader {
    file: File,
    size: u64,
    chunk_size: usize,
}

#[async_trait]
impl RemoteReader for FileReader {
    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let read = self.file.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf.freeze()))
    }
}

#[async_trait]
impl RemoteSource for DirectorySource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    /// Every regular file below the root, sorted by relative path.
    async fn list(&self) -> Result<Vec<RemoteFile>> {
        if !tokio::fs::metadata(&self.root).await?.is_dir() {
            return Err(SourceError::NotFound(self.describe()));
        }

        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let Some(name) = relative_name(&self.root, &path) else {
                        continue;
                    };
                    files.push(RemoteFile {
                        remote_ref: path.to_string_lossy().into_owned(),
                        name,
                        size: entry.metadata().await?.len(),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn open(&self, file: &RemoteFile) -> Result<Box<dyn RemoteReader>> {
        let handle = File::open(&file.remote_ref).await?;
        let size = handle.metadata().await?.len();
        Ok(Box::new(FileReader {
            file: handle,
            size,
            chunk_size: self.chunk_size,
        }))
    }
}

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use super::errors::{Result, UploadError};
use super::planner::ChunkDescriptor;
use super::traits::UploadSource;

/// A file on the local disk.
///
/// Size and modification time are captured on open. The file is reopened for every chunk
/// so no descriptor is held across a pause.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
    last_modified_ms: i64,
}

impl LocalFile {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::InvalidOptions(format!("Not a file: {}", path.display())));
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::InvalidOptions(format!("Can't read file name of {}", path.display())))?
            .to_string();

        let last_modified_ms = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or_default();

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            last_modified_ms,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UploadSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    async fn read_range(&self, chunk: &ChunkDescriptor) -> Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(chunk.byte_start)).await?;

        let mut buffer = vec![0u8; chunk.len() as usize];
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }
}

/// File contents held in memory.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    data: Bytes,
    last_modified_ms: i64,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>, last_modified_ms: i64) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            last_modified_ms,
        }
    }
}

#[async_trait]
impl UploadSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    async fn read_range(&self, chunk: &ChunkDescriptor) -> Result<Bytes> {
        let start = chunk.byte_start as usize;
        let end = chunk.byte_end as usize;
        if end > self.data.len() || start > end {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range {}..{} out of bounds for {} bytes", start, end, self.data.len()),
            )));
        }

        Ok(self.data.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::plan;

    #[tokio::test]
    async fn test_local_file_reads_exact_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let file = LocalFile::open(&path).await.unwrap();
        assert_eq!(file.name(), "clip.bin");
        assert_eq!(file.size(), 1000);
        assert!(file.file_id().as_str().starts_with("clip.bin-1000-"));

        let mut joined = Vec::new();
        for chunk in plan(file.size(), 300) {
            let bytes = file.read_range(&chunk).await.unwrap();
            assert_eq!(bytes.len() as u64, chunk.len());
            joined.extend_from_slice(&bytes);
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_local_file_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFile::open(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_file_out_of_bounds() {
        let file = MemoryFile::new("a.txt", b"hello".to_vec(), 1);
        let chunk = ChunkDescriptor { index: 0, byte_start: 3, byte_end: 9 };
        assert!(matches!(file.read_range(&chunk).await, Err(UploadError::Io(_))));
    }
}

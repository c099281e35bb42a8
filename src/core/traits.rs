use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;
use super::errors::Result;
use super::planner::ChunkDescriptor;
use super::types::{FileId, UploadSession};

/// 文件句柄 - 上传期间必须可读
#[async_trait]
pub trait UploadSource: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Modification time in epoch milliseconds.
    fn last_modified_ms(&self) -> i64;

    /// Reads exactly the bytes of `chunk`.
    async fn read_range(&self, chunk: &ChunkDescriptor) -> Result<Bytes>;

    fn file_id(&self) -> FileId {
        FileId::derive(self.name(), self.size(), self.last_modified_ms())
    }
}

/// 传输适配器 - 负责实际的网络请求
///
/// Implementations must stop promptly once `cancel` fires and report `UploadError::Cancelled`.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Sends one chunk. Any error counts as a failed attempt.
    async fn upload_chunk(
        &self,
        destination: &Url,
        session: &UploadSession,
        index: usize,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Asks the server to assemble the session. Returns the final url of the file.
    async fn complete_upload(
        &self,
        destination: &Url,
        session: &UploadSession,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// 存储适配器 - 字符串键值对的持久化
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;
}

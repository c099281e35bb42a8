use std::collections::HashSet;
use std::time::Duration;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::utils::retry::Backoff;
use super::errors::{Result, UploadError};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default number of attempts per chunk.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between two attempts of the same chunk.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

// 用于序列化 Duration
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Stable identity of a file on disk: name, size and modification time.
///
/// Not a content hash. Two different files sharing all three values collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn derive(name: &str, size: u64, last_modified_ms: i64) -> Self {
        Self(format!("{}-{}-{}", name, size, last_modified_ms))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client generated token the server uses to group chunks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Error,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }
}

/// Per chunk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

/// Durable record of one resumable upload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub file_id: FileId,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: usize,
    pub chunk_size: u64,
    /// Confirmed chunk indices, in the order the server acknowledged them.
    pub uploaded_chunks: Vec<usize>,
    pub session_id: SessionId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UploadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadSession {
    pub fn new(file_id: FileId, file_name: impl Into<String>, file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_id,
            file_name: file_name.into(),
            file_size,
            total_chunks: super::planner::total_chunks(file_size, chunk_size),
            chunk_size,
            uploaded_chunks: Vec::new(),
            session_id: SessionId::new(),
            // Stored as epoch milliseconds
            created_at: Utc::now().trunc_subsecs(3),
            status: Some(UploadStatus::Pending),
            error: None,
        }
    }

    pub fn is_uploaded(&self, index: usize) -> bool {
        self.uploaded_chunks.contains(&index)
    }

    /// Credits a chunk. Returns false if the index was already credited or out of range.
    pub fn mark_uploaded(&mut self, index: usize) -> bool {
        if index >= self.total_chunks || self.is_uploaded(index) {
            return false;
        }

        self.uploaded_chunks.push(index);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() == self.total_chunks
    }

    /// Credited indices for repeated lookups.
    pub fn uploaded_set(&self) -> HashSet<usize> {
        self.uploaded_chunks.iter().copied().collect()
    }

    pub fn pending_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let uploaded = self.uploaded_set();
        (0..self.total_chunks).filter(move |index| !uploaded.contains(index))
    }

    /// Approximate byte count confirmed so far. The short final chunk counts as full, capped at the file size.
    pub fn uploaded_size(&self) -> u64 {
        (self.uploaded_chunks.len() as u64)
            .saturating_mul(self.chunk_size)
            .min(self.file_size)
    }

    /// Drops indices outside `0..total_chunks` and duplicates left by a hand edited or foreign record.
    pub(crate) fn normalize(&mut self) {
        let total = self.total_chunks;
        let mut seen = HashSet::with_capacity(self.uploaded_chunks.len());
        self.uploaded_chunks
            .retain(|index| *index < total && seen.insert(*index));
    }
}

/// Progress snapshot delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub file_id: FileId,
    pub file_name: String,
    pub status: UploadStatus,
    /// Parallel to the chunk map of the session.
    pub chunks: Vec<ChunkStatus>,
    pub total_chunks: usize,
    pub uploaded_chunks: usize,
    pub uploaded_size: u64,
    pub total_size: u64,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadProgress {
    /// Rebuilds a snapshot from a session. Credited chunks are completed, the rest pending.
    pub fn from_session(session: &UploadSession, status: UploadStatus) -> Self {
        let uploaded = session.uploaded_set();
        let chunks = (0..session.total_chunks)
            .map(|index| {
                if uploaded.contains(&index) {
                    ChunkStatus::Completed
                } else {
                    ChunkStatus::Pending
                }
            })
            .collect();

        let mut progress = Self {
            file_id: session.file_id.clone(),
            file_name: session.file_name.clone(),
            status,
            chunks,
            total_chunks: session.total_chunks,
            uploaded_chunks: 0,
            uploaded_size: 0,
            total_size: session.file_size,
            percentage: 0.0,
            error: None,
        };
        progress.refresh(session);
        progress
    }

    /// Recomputes counters from the session.
    pub fn refresh(&mut self, session: &UploadSession) {
        self.uploaded_chunks = session.uploaded_chunks.len();
        self.uploaded_size = session.uploaded_size();
        self.percentage = if self.status == UploadStatus::Completed {
            100.0
        } else if session.file_size > 0 {
            (self.uploaded_size as f64 / session.file_size as f64) * 100.0
        } else {
            0.0
        };
    }

    pub fn set_chunk(&mut self, index: usize, status: ChunkStatus) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            *chunk = status;
        }
    }
}

/// Per call tuning of an upload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UploadOptions {
    /// Only used when a new session is created. A resumed session keeps its own chunk size.
    pub chunk_size: u64,
    /// Attempts per chunk, including the first one.
    pub max_retries: u32,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub retry_delay: Duration,
    pub backoff: Backoff,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::Linear,
        }
    }
}

impl UploadOptions {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidOptions("chunk_size must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(UploadError::InvalidOptions("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// How an upload call settled when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Finalized, carrying the url reported by the server.
    Completed { url: String },
    /// Stopped by `pause_upload`; the session stays persisted.
    Paused,
    /// Stopped by `cancel_upload`; the session was deleted.
    Cancelled,
}

impl UploadOutcome {
    pub fn url(&self) -> Option<&str> {
        match self {
            UploadOutcome::Completed { url } => Some(url.as_str()),
            _ => None,
        }
    }
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 进度更新
    Progress {
        file_id: FileId,
        progress: UploadProgress,
    },
    /// 状态变更
    StateChanged {
        file_id: FileId,
        old_state: UploadStatus,
        new_state: UploadStatus,
    },
    /// 任务完成
    Completed {
        file_id: FileId,
        url: String,
    },
    /// 任务失败
    Failed {
        file_id: FileId,
        error: String,
    },
    /// 已取消，会话已删除
    Cancelled {
        file_id: FileId,
    },
}

impl UploadEvent {
    pub fn file_id(&self) -> &FileId {
        match self {
            UploadEvent::Progress { file_id, .. }
            | UploadEvent::StateChanged { file_id, .. }
            | UploadEvent::Completed { file_id, .. }
            | UploadEvent::Failed { file_id, .. }
            | UploadEvent::Cancelled { file_id } => file_id,
        }
    }
}

// 静态断言确保类型是 Send 的
#[allow(dead_code)]
const _: () = {
    fn assert_send<T: Send + Sync>() {}
    fn assert_types() {
        assert_send::<UploadSession>();
        assert_send::<UploadEvent>();
        assert_send::<UploadProgress>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    fn session(file_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(FileId::derive("video.mp4", file_size, 1_700_000_000_000), "video.mp4", file_size, chunk_size)
    }

    #[test]
    fn test_file_id_is_stable() {
        let a = FileId::derive("video.mp4", 42, 1_700_000_000_000);
        let b = FileId::derive("video.mp4", 42, 1_700_000_000_000);
        let c = FileId::derive("video.mp4", 42, 1_700_000_000_001);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "video.mp4-42-1700000000000");
    }

    #[test]
    fn test_session_credits_each_chunk_once() {
        let mut session = session(10, 4);
        assert_eq!(session.total_chunks, 3);

        assert!(session.mark_uploaded(1));
        assert!(!session.mark_uploaded(1));
        assert!(!session.mark_uploaded(3));
        assert!(session.mark_uploaded(0));
        assert!(!session.is_complete());
        assert!(session.mark_uploaded(2));
        assert!(session.is_complete());
        assert_eq!(session.uploaded_chunks, vec![1, 0, 2]);
        assert_eq!(session.uploaded_size(), 10);
    }

    #[test]
    fn test_session_record_format() {
        let mut session = session(10, 4);
        session.mark_uploaded(0);
        session.status = None;

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["fileId"], "video.mp4-10-1700000000000");
        assert_eq!(value["fileName"], "video.mp4");
        assert_eq!(value["fileSize"], 10);
        assert_eq!(value["totalChunks"], 3);
        assert_eq!(value["chunkSize"], 4);
        assert_eq!(value["uploadedChunks"], serde_json::json!([0]));
        assert!(value["sessionId"].is_string());
        assert!(value["createdAt"].is_i64());
        assert!(value.get("status").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_normalize_drops_foreign_indices() {
        let mut session = session(10, 4);
        session.uploaded_chunks = vec![0, 7, 0, 2];
        session.normalize();
        assert_eq!(session.uploaded_chunks, vec![0, 2]);
    }

    #[test]
    fn test_progress_from_session() {
        let mut session = session(10, 4);
        session.mark_uploaded(0);
        session.mark_uploaded(2);

        let progress = UploadProgress::from_session(&session, UploadStatus::Paused);
        assert_eq!(progress.chunks, vec![ChunkStatus::Completed, ChunkStatus::Pending, ChunkStatus::Completed]);
        assert_eq!(progress.uploaded_chunks, 2);
        assert_eq!(progress.uploaded_size, 8);
        assert_eq!(progress.percentage, 80.0);
    }

    #[test]
    fn test_options_validation() {
        assert!(UploadOptions::default().validate().is_ok());
        assert!(UploadOptions::default().with_chunk_size(0).validate().is_err());
        assert!(UploadOptions::default().with_max_retries(0).validate().is_err());
    }

    #[test]
    fn test_large_session_lookups_scale() {
        let chunks = 40_000u64;
        let mut session = session(chunks * DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE);
        // Every chunk but the last, in reverse, each one twice
        session.uploaded_chunks = (0..chunks as usize - 1).rev().flat_map(|i| [i, i]).collect();

        let started = std::time::Instant::now();
        session.normalize();
        let pending: Vec<_> = session.pending_indices().collect();
        let progress = UploadProgress::from_session(&session, UploadStatus::Paused);
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

        assert_eq!(session.uploaded_chunks.len(), 39_999);
        assert_eq!(session.uploaded_chunks[0], 39_998);
        assert_eq!(pending, vec![39_999]);
        assert_eq!(progress.chunks[39_999], ChunkStatus::Pending);
        assert_eq!(progress.uploaded_chunks, 39_999);
    }
}

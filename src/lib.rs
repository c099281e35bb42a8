//! Resumable chunked uploads.
//!
//! A file is split into fixed size chunks that are sent one by one. Confirmed chunks are
//! recorded in a [`SessionStore`] after each acknowledgment, so an interrupted upload
//! continues where it stopped instead of starting over.

pub mod config;
pub mod core;
pub mod transport;
pub mod utils;

// 重新导出核心类型
pub use crate::core::{
    ChunkDescriptor,
    ChunkStatus,
    ChunkTransport,
    FileId,
    FileStorage,
    LocalFile,
    MemoryFile,
    MemoryStorage,
    ProgressBroadcaster,
    Result,
    SessionId,
    SessionStore,
    StorageBackend,
    UploadError,
    UploadEvent,
    UploadOptions,
    UploadOrchestrator,
    UploadOutcome,
    UploadProgress,
    UploadSession,
    UploadSource,
    UploadStatus,
};

pub use transport::{HttpTransport, HttpTransportConfig};
pub use utils::retry::Backoff;

mod broadcaster;
mod errors;
mod orchestrator;
mod source;
mod store;
mod traits;
mod types;
pub mod planner;

pub use broadcaster::{ProgressBroadcaster, ProgressCallback};
pub use errors::{Result, UploadError};
pub use orchestrator::UploadOrchestrator;
pub use planner::{plan, total_chunks, ChunkDescriptor};
pub use source::{LocalFile, MemoryFile};
pub use store::{FileStorage, MemoryStorage, SessionStore, SESSIONS_KEY};
pub use traits::{ChunkTransport, StorageBackend, UploadSource};
pub use types::{
    ChunkStatus,
    FileId,
    SessionId,
    UploadEvent,
    UploadOptions,
    UploadOutcome,
    UploadProgress,
    UploadSession,
    UploadStatus,
    DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY,
};

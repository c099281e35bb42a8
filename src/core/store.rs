use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use super::errors::Result;
use super::traits::StorageBackend;
use super::types::{FileId, UploadSession};

/// Key holding every session as one JSON array.
pub const SESSIONS_KEY: &str = "resumable-upload:sessions";

/// In process storage. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().await.remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
///
/// Writes go to a temporary sibling first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(value.as_bytes()).await?;
        // Durable before it replaces the previous record
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// CRUD over persisted upload sessions. Last writer wins per `file_id`.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    // Serializes read-modify-write cycles of this process.
    write_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Every persisted session. Unreadable or corrupt storage yields an empty list.
    pub async fn list(&self) -> Vec<UploadSession> {
        match self.load().await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!("Failed to read upload sessions: {}", err);
                Vec::new()
            }
        }
    }

    pub async fn get(&self, file_id: &FileId) -> Option<UploadSession> {
        self.list()
            .await
            .into_iter()
            .find(|session| &session.file_id == file_id)
    }

    /// Inserts or replaces the record with the same `file_id`.
    pub async fn save(&self, session: &UploadSession) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await?;

        match sessions.iter_mut().find(|s| s.file_id == session.file_id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }

        self.write(&sessions).await?;
        debug!(
            "Saved session {} ({}/{} chunks)",
            session.file_id,
            session.uploaded_chunks.len(),
            session.total_chunks
        );
        Ok(())
    }

    pub async fn delete(&self, file_id: &FileId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await?;
        let before = sessions.len();
        sessions.retain(|session| &session.file_id != file_id);

        if sessions.len() != before {
            self.write(&sessions).await?;
            debug!("Deleted session {}", file_id);
        }
        Ok(())
    }

    /// Deletes sessions created more than `max_age` ago. Returns how many were removed.
    pub async fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let cutoff = Utc::now() - max_age;
        let mut sessions = self.load().await?;
        let before = sessions.len();
        sessions.retain(|session| session.created_at >= cutoff);

        let removed = before - sessions.len();
        if removed > 0 {
            self.write(&sessions).await?;
        }
        Ok(removed)
    }

    /// Backend failures propagate so a write never replaces records it could not read.
    /// Corrupt data counts as empty.
    async fn load(&self) -> Result<Vec<UploadSession>> {
        let Some(data) = self.backend.get_item(SESSIONS_KEY).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<UploadSession>>(&data) {
            Ok(mut sessions) => {
                sessions.iter_mut().for_each(UploadSession::normalize);
                Ok(sessions)
            }
            Err(err) => {
                warn!("Discarding corrupt upload sessions: {}", err);
                Ok(Vec::new())
            }
        }
    }

    async fn write(&self, sessions: &[UploadSession]) -> Result<()> {
        if sessions.is_empty() {
            return self.backend.remove_item(SESSIONS_KEY).await;
        }

        let data = serde_json::to_string(sessions)?;
        self.backend.set_item(SESSIONS_KEY, &data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory storage whose reads can be made to fail.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_reads: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for FlakyStorage {
        async fn get_item(&self, key: &str) -> Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("EIO").into());
            }
            self.inner.get_item(key).await
        }

        async fn set_item(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set_item(key, value).await
        }

        async fn remove_item(&self, key: &str) -> Result<()> {
            self.inner.remove_item(key).await
        }
    }

    fn session(name: &str, size: u64) -> UploadSession {
        UploadSession::new(FileId::derive(name, size, 1), name, size, 4)
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = SessionStore::in_memory();
        let mut a = session("a.bin", 10);
        let b = session("b.bin", 20);

        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        assert_eq!(store.list().await.len(), 2);

        a.mark_uploaded(1);
        store.save(&a).await.unwrap();
        let loaded = store.get(&a.file_id).await.unwrap();
        assert_eq!(loaded.uploaded_chunks, vec![1]);
        assert_eq!(store.list().await.len(), 2);

        store.delete(&a.file_id).await.unwrap();
        assert!(store.get(&a.file_id).await.is_none());
        assert!(store.get(&b.file_id).await.is_some());

        store.delete(&b.file_id).await.unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_store_lists_empty() {
        let backend = Arc::new(MemoryStorage::new());
        backend.set_item(SESSIONS_KEY, "{not json").await.unwrap();
        let store = SessionStore::new(backend.clone());

        assert!(store.list().await.is_empty());

        // A save replaces the corrupt value
        store.save(&session("a.bin", 10)).await.unwrap();
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = session("a.bin", 10);
        a.mark_uploaded(0);

        {
            let store = SessionStore::new(Arc::new(FileStorage::new(dir.path()).await.unwrap()));
            store.save(&a).await.unwrap();
        }

        let store = SessionStore::new(Arc::new(FileStorage::new(dir.path()).await.unwrap()));
        let loaded = store.get(&a.file_id).await.unwrap();
        assert_eq!(loaded, a);
    }

    #[tokio::test]
    async fn test_file_storage_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).await.unwrap();
        assert!(storage.get_item("nothing").await.unwrap().is_none());
        storage.remove_item("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let store = SessionStore::in_memory();
        let mut old = session("old.bin", 10);
        old.created_at = Utc::now() - chrono::Duration::days(30);
        let fresh = session("fresh.bin", 10);
        store.save(&old).await.unwrap();
        store.save(&fresh).await.unwrap();

        let removed = store.prune_older_than(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&fresh.file_id).await.is_some());
        assert!(store.get(&old.file_id).await.is_none());
    }

    #[tokio::test]
    async fn test_read_failure_never_overwrites() {
        let backend = Arc::new(FlakyStorage::default());
        let store = SessionStore::new(backend.clone());
        let a = session("a.bin", 10);
        let b = session("b.bin", 10);
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        backend.fail_reads.store(true, Ordering::SeqCst);
        assert!(store.list().await.is_empty());
        assert!(store.save(&session("c.bin", 10)).await.is_err());
        assert!(store.delete(&a.file_id).await.is_err());
        assert!(store.prune_older_than(chrono::Duration::zero()).await.is_err());

        backend.fail_reads.store(false, Ordering::SeqCst);
        let names: Vec<_> = store.list().await.into_iter().map(|s| s.file_name).collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);
    }

    #[tokio::test]
    async fn test_file_storage_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).await.unwrap();
        storage.set_item(SESSIONS_KEY, "[]").await.unwrap();
        storage.set_item(SESSIONS_KEY, "[1]").await.unwrap();

        assert_eq!(storage.get_item(SESSIONS_KEY).await.unwrap().as_deref(), Some("[1]"));
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["resumable-upload_sessions.json"]);
    }
}

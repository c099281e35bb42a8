use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;
use super::types::{FileId, UploadEvent, UploadProgress};

/// Progress callback for one file.
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

/// Delivers progress snapshots to observers.
///
/// Two surfaces: one callback slot per file (a new registration replaces the old one)
/// and a broadcast channel of typed events every subscriber receives.
pub struct ProgressBroadcaster {
    callbacks: RwLock<HashMap<FileId, ProgressCallback>>,
    event_tx: broadcast::Sender<UploadEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);

        Self {
            callbacks: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn set_callback<F>(&self, file_id: FileId, callback: F)
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(file_id, Arc::new(callback));
    }

    pub fn remove_callback(&self, file_id: &FileId) {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(file_id);
    }

    pub fn has_callback(&self, file_id: &FileId) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(file_id)
    }

    /// Hands a snapshot to the registered callback and to event subscribers. Never fails.
    pub fn emit(&self, file_id: &FileId, progress: &UploadProgress) {
        let callback = self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(file_id)
            .cloned();

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
                warn!("Progress callback for {} panicked", file_id);
            }
        }

        self.publish(UploadEvent::Progress {
            file_id: file_id.clone(),
            progress: progress.clone(),
        });
    }

    /// Sends an event to subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: UploadEvent) {
        let _ = self.event_tx.send(event);
    }

    /// 订阅事件
    ///
    /// A receiver that falls more than the channel capacity behind gets `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        // 最大缓存 256 个事件
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::core::types::{UploadSession, UploadStatus};

    fn progress(file_id: &FileId, status: UploadStatus) -> UploadProgress {
        let session = UploadSession::new(file_id.clone(), "a.bin", 10, 4);
        UploadProgress::from_session(&session, status)
    }

    #[test]
    fn test_new_callback_replaces_old() {
        let broadcaster = ProgressBroadcaster::default();
        let file_id = FileId::from("a.bin-10-1");
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let counter = first.clone();
        broadcaster.set_callback(file_id.clone(), move |_| *counter.lock().unwrap() += 1);
        let counter = second.clone();
        broadcaster.set_callback(file_id.clone(), move |_| *counter.lock().unwrap() += 1);

        broadcaster.emit(&file_id, &progress(&file_id, UploadStatus::Pending));
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);

        broadcaster.remove_callback(&file_id);
        assert!(!broadcaster.has_callback(&file_id));
        broadcaster.emit(&file_id, &progress(&file_id, UploadStatus::Pending));
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let broadcaster = ProgressBroadcaster::default();
        let file_id = FileId::from("a.bin-10-1");
        broadcaster.set_callback(file_id.clone(), |_| panic!("observer bug"));

        broadcaster.emit(&file_id, &progress(&file_id, UploadStatus::Uploading));
        broadcaster.emit(&file_id, &progress(&file_id, UploadStatus::Uploading));
    }

    #[tokio::test]
    async fn test_subscribers_receive_progress_events() {
        let broadcaster = ProgressBroadcaster::default();
        let file_id = FileId::from("a.bin-10-1");
        let mut receiver = broadcaster.subscribe();

        broadcaster.emit(&file_id, &progress(&file_id, UploadStatus::Pending));

        match receiver.recv().await.unwrap() {
            UploadEvent::Progress { file_id: id, progress } => {
                assert_eq!(id, file_id);
                assert_eq!(progress.status, UploadStatus::Pending);
            }
            other => panic!("Expected progress event, got {:?}", other),
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use crate::utils::retry::{retry_with_cancel, RetryPolicy};
use super::broadcaster::ProgressBroadcaster;
use super::errors::{Result, UploadError};
use super::planner::{plan, ChunkDescriptor};
use super::store::SessionStore;
use super::traits::{ChunkTransport, UploadSource};
use super::types::{
    ChunkStatus, FileId, UploadEvent, UploadOptions, UploadOutcome, UploadProgress, UploadSession,
    UploadStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Control block of an upload running in this orchestrator.
#[derive(Clone)]
struct ActiveUpload {
    token: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
    progress: Arc<Mutex<UploadProgress>>,
}

impl ActiveUpload {
    fn new(progress: UploadProgress) -> Self {
        Self {
            token: CancellationToken::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(progress)),
        }
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

/// Removes the control block when the upload future settles or is dropped.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<FileId, ActiveUpload>>,
    file_id: FileId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.file_id);
    }
}

/// Drives resumable chunked uploads.
///
/// Chunks go out one at a time in ascending order. Every confirmed chunk is persisted
/// before the next one starts, so a crash loses at most the chunk in flight.
pub struct UploadOrchestrator {
    store: SessionStore,
    transport: Arc<dyn ChunkTransport>,
    broadcaster: ProgressBroadcaster,
    defaults: UploadOptions,
    active: Mutex<HashMap<FileId, ActiveUpload>>,
}

impl UploadOrchestrator {
    pub fn new(store: SessionStore, transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            store,
            transport,
            broadcaster: ProgressBroadcaster::default(),
            defaults: UploadOptions::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Options used by callers that pass none of their own.
    pub fn with_defaults(mut self, defaults: UploadOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &UploadOptions {
        &self.defaults
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Starts a fresh upload, replacing any persisted session of the same file.
    pub async fn upload_file(
        &self,
        source: &dyn UploadSource,
        destination: &str,
        options: Option<UploadOptions>,
    ) -> Result<UploadOutcome> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        options.validate()?;
        let destination = Url::parse(destination)?;

        let file_id = source.file_id();
        let mut session = UploadSession::new(file_id.clone(), source.name(), source.size(), options.chunk_size);
        let (control, _guard) = self.register(&session)?;

        if self.store.get(&file_id).await.is_some() {
            info!("Replacing existing session of {}", file_id);
        }
        info!(
            "Upload {} started: {} bytes in {} chunks",
            file_id, session.file_size, session.total_chunks
        );

        let result = match self.store.save(&session).await {
            Ok(()) => {
                self.emit(&control);
                self.run(&mut session, source, &destination, &options, &control).await
            }
            Err(err) => Err(err),
        };

        self.settle(&control, &mut session, result).await
    }

    /// Continues a persisted session, skipping chunks the server already confirmed.
    pub async fn resume_upload(
        &self,
        source: &dyn UploadSource,
        destination: &str,
        options: Option<UploadOptions>,
    ) -> Result<UploadOutcome> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        options.validate()?;
        let destination = Url::parse(destination)?;

        let file_id = source.file_id();
        let mut session = self
            .store
            .get(&file_id)
            .await
            .ok_or_else(|| UploadError::NoSessionFound(file_id.clone()))?;

        if session.chunk_size != options.chunk_size {
            debug!(
                "Keeping chunk size {} of session {} (requested {})",
                session.chunk_size, file_id, options.chunk_size
            );
        }

        let (control, _guard) = self.register(&session)?;
        info!(
            "Upload {} resumed: {}/{} chunks already confirmed",
            file_id,
            session.uploaded_chunks.len(),
            session.total_chunks
        );

        self.emit(&control);
        let result = self.run(&mut session, source, &destination, &options, &control).await;

        self.settle(&control, &mut session, result).await
    }

    /// Stops a running upload before its next chunk and aborts the one in flight.
    ///
    /// The session stays persisted. Returns false if nothing was running for `file_id`.
    pub fn pause_upload(&self, file_id: &FileId) -> bool {
        match lock(&self.active).get(file_id) {
            Some(control) => {
                info!("Pausing upload {}", file_id);
                control.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Pauses the upload and deletes its session. No call reaches the server.
    ///
    /// Returns true if an upload was running for `file_id`.
    pub async fn cancel_upload(&self, file_id: &FileId) -> Result<bool> {
        let running = lock(&self.active).get(file_id).cloned();

        if let Some(control) = &running {
            info!("Cancelling upload {}", file_id);
            control.cancel_requested.store(true, Ordering::SeqCst);
            control.token.cancel();
        }

        let existed = self.store.get(file_id).await.is_some();
        self.store.delete(file_id).await?;

        // A running upload reports its own cancellation once it stops
        if running.is_none() && existed {
            self.broadcaster.publish(UploadEvent::Cancelled { file_id: file_id.clone() });
        }

        Ok(running.is_some())
    }

    /// Snapshot of a running upload, or one rebuilt from its persisted session.
    pub async fn get_upload_progress(&self, file_id: &FileId) -> Option<UploadProgress> {
        if let Some(control) = lock(&self.active).get(file_id) {
            return Some(lock(&control.progress).clone());
        }

        let session = self.store.get(file_id).await?;
        let status = match session.status {
            Some(UploadStatus::Error) => UploadStatus::Error,
            // Persisted as uploading but not running here: interrupted
            Some(UploadStatus::Uploading) | Some(UploadStatus::Paused) => UploadStatus::Paused,
            _ if !session.uploaded_chunks.is_empty() => UploadStatus::Paused,
            _ => UploadStatus::Pending,
        };

        let mut progress = UploadProgress::from_session(&session, status);
        progress.error = session.error.clone();
        Some(progress)
    }

    /// Sessions not yet finalized or cancelled, e.g. to offer resuming after a restart.
    pub async fn get_pending_uploads(&self) -> Vec<UploadSession> {
        self.store.list().await
    }

    pub fn is_active(&self, file_id: &FileId) -> bool {
        lock(&self.active).contains_key(file_id)
    }

    pub fn set_progress_callback<F>(&self, file_id: FileId, callback: F)
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.broadcaster.set_callback(file_id, callback);
    }

    pub fn remove_progress_callback(&self, file_id: &FileId) {
        self.broadcaster.remove_callback(file_id);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.broadcaster.subscribe()
    }

    fn register(&self, session: &UploadSession) -> Result<(ActiveUpload, ActiveGuard<'_>)> {
        let mut active = lock(&self.active);
        if active.contains_key(&session.file_id) {
            return Err(UploadError::AlreadyActive(session.file_id.clone()));
        }

        let control = ActiveUpload::new(UploadProgress::from_session(session, UploadStatus::Pending));
        active.insert(session.file_id.clone(), control.clone());

        let guard = ActiveGuard {
            active: &self.active,
            file_id: session.file_id.clone(),
        };
        Ok((control, guard))
    }

    /// The shared chunk loop of upload and resume.
    async fn run(
        &self,
        session: &mut UploadSession,
        source: &dyn UploadSource,
        destination: &Url,
        options: &UploadOptions,
        control: &ActiveUpload,
    ) -> Result<UploadOutcome> {
        let policy = RetryPolicy::from(options);
        let uploaded = session.uploaded_set();
        // take() drops the zero-length chunk planned for an empty file
        let pending: Vec<ChunkDescriptor> = plan(session.file_size, session.chunk_size)
            .into_iter()
            .take(session.total_chunks)
            .filter(|chunk| !uploaded.contains(&chunk.index))
            .collect();

        session.status = Some(UploadStatus::Uploading);
        session.error = None;
        self.store.save(session).await?;
        self.set_status(control, UploadStatus::Uploading);

        for chunk in pending {
            let index = chunk.index;
            if control.token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            self.update(control, |progress| progress.set_chunk(index, ChunkStatus::Uploading));

            let data = match source.read_range(&chunk).await {
                Ok(data) => data,
                Err(err) => {
                    lock(&control.progress).set_chunk(index, ChunkStatus::Error);
                    return Err(err);
                }
            };

            let transport = self.transport.as_ref();
            let snapshot: &UploadSession = session;
            let token = &control.token;
            let result = retry_with_cancel(policy, token, move || {
                transport.upload_chunk(destination, snapshot, index, data.clone(), token)
            })
            .await;

            match result {
                Ok(()) => {
                    // Cancelled while the last bytes were acknowledged: the session is gone
                    if control.is_cancel_requested() {
                        return Err(UploadError::Cancelled);
                    }

                    session.mark_uploaded(index);
                    self.store.save(session).await?;

                    let snapshot: &UploadSession = session;
                    self.update(control, |progress| {
                        progress.set_chunk(index, ChunkStatus::Completed);
                        progress.refresh(snapshot);
                    });
                    debug!(
                        "Chunk {} of {} confirmed ({}/{})",
                        index,
                        session.file_id,
                        session.uploaded_chunks.len(),
                        session.total_chunks
                    );
                }
                Err(UploadError::Cancelled) => {
                    // Never partially credited
                    lock(&control.progress).set_chunk(index, ChunkStatus::Pending);
                    return Err(UploadError::Cancelled);
                }
                Err(err) => {
                    error!("Chunk {} of {} failed after retries: {}", index, session.file_id, err);
                    lock(&control.progress).set_chunk(index, ChunkStatus::Error);
                    return Err(err);
                }
            }
        }

        if control.token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let url = self
            .transport
            .complete_upload(destination, session, &control.token)
            .await?;

        // The server already assembled the file, so a leftover record must not fail the upload
        if let Err(err) = self.store.delete(&session.file_id).await {
            warn!("Failed to delete finished session {}: {}", session.file_id, err);
        }

        let snapshot: &UploadSession = session;
        self.update(control, |progress| {
            progress.status = UploadStatus::Completed;
            progress.error = None;
            progress.refresh(snapshot);
        });
        self.broadcaster.publish(UploadEvent::StateChanged {
            file_id: session.file_id.clone(),
            old_state: UploadStatus::Uploading,
            new_state: UploadStatus::Completed,
        });
        self.broadcaster.publish(UploadEvent::Completed {
            file_id: session.file_id.clone(),
            url: url.clone(),
        });
        info!("Upload {} completed: {}", session.file_id, url);

        Ok(UploadOutcome::Completed { url })
    }

    /// Turns the loop result into the caller's outcome. Every path emits before returning.
    async fn settle(
        &self,
        control: &ActiveUpload,
        session: &mut UploadSession,
        result: Result<UploadOutcome>,
    ) -> Result<UploadOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(UploadError::Cancelled) if control.is_cancel_requested() => {
                if let Err(err) = self.store.delete(&session.file_id).await {
                    warn!("Failed to delete cancelled session {}: {}", session.file_id, err);
                }

                self.set_status(control, UploadStatus::Paused);
                self.broadcaster.publish(UploadEvent::Cancelled {
                    file_id: session.file_id.clone(),
                });
                info!("Upload {} cancelled", session.file_id);

                Ok(UploadOutcome::Cancelled)
            }
            Err(UploadError::Cancelled) => {
                session.status = Some(UploadStatus::Paused);
                if let Err(err) = self.store.save(session).await {
                    warn!("Failed to persist paused session {}: {}", session.file_id, err);
                }

                self.set_status(control, UploadStatus::Paused);
                info!(
                    "Upload {} paused at {}/{} chunks",
                    session.file_id,
                    session.uploaded_chunks.len(),
                    session.total_chunks
                );

                Ok(UploadOutcome::Paused)
            }
            Err(err) => {
                let message = err.to_string();
                session.status = Some(UploadStatus::Error);
                session.error = Some(message.clone());
                if let Err(save_err) = self.store.save(session).await {
                    warn!("Failed to persist failed session {}: {}", session.file_id, save_err);
                }

                {
                    let mut progress = lock(&control.progress);
                    progress.error = Some(message.clone());
                }
                self.set_status(control, UploadStatus::Error);
                self.broadcaster.publish(UploadEvent::Failed {
                    file_id: session.file_id.clone(),
                    error: message,
                });
                error!("Upload {} failed: {}", session.file_id, err);

                Err(err)
            }
        }
    }

    /// Applies `f` to the live snapshot and emits the result.
    fn update<F>(&self, control: &ActiveUpload, f: F)
    where
        F: FnOnce(&mut UploadProgress),
    {
        {
            let mut progress = lock(&control.progress);
            f(&mut progress);
        }
        self.emit(control);
    }

    fn set_status(&self, control: &ActiveUpload, status: UploadStatus) {
        let (file_id, old_state) = {
            let mut progress = lock(&control.progress);
            let old_state = progress.status;
            progress.status = status;
            (progress.file_id.clone(), old_state)
        };

        self.emit(control);
        if old_state != status {
            self.broadcaster.publish(UploadEvent::StateChanged {
                file_id,
                old_state,
                new_state: status,
            });
        }
    }

    fn emit(&self, control: &ActiveUpload) {
        let snapshot = lock(&control.progress).clone();
        self.broadcaster.emit(&snapshot.file_id, &snapshot);
    }
}

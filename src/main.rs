use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;
use resumable_upload::config::Config;
use resumable_upload::utils::format_progress;
use resumable_upload::{
    FileId, FileStorage, HttpTransport, LocalFile, SessionStore, UploadEvent, UploadOrchestrator,
    UploadOutcome, UploadSource,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let storage = FileStorage::new(&config.state_dir)
        .await
        .with_context(|| format!("Failed to open state dir: {}", config.state_dir.display()))?;
    let transport = HttpTransport::with_config(config.transport_config())?;
    let orchestrator = Arc::new(
        UploadOrchestrator::new(SessionStore::new(Arc::new(storage)), Arc::new(transport))
            .with_defaults(config.upload_options()),
    );

    let file = LocalFile::open(&config.file_path)
        .await
        .with_context(|| format!("Failed to open file: {}", config.file_path.display()))?;
    let file_id = file.file_id();

    let pending = orchestrator.get_pending_uploads().await;
    for session in &pending {
        info!(
            "Interrupted upload {}: {}/{} chunks",
            session.file_name,
            session.uploaded_chunks.len(),
            session.total_chunks
        );
    }
    let resume = pending.iter().any(|session| session.file_id == file_id);

    let events = tokio::spawn(print_events(orchestrator.subscribe_events()));
    let done = Arc::new(AtomicBool::new(false));
    let keyboard = if std::io::stdin().is_terminal() {
        let orchestrator = orchestrator.clone();
        let done = done.clone();
        let file_id = file_id.clone();
        let handle = Handle::current();
        Some(tokio::task::spawn_blocking(move || handle_keyboard(orchestrator, file_id, done, handle)))
    } else {
        None
    };

    let outcome = if resume {
        orchestrator.resume_upload(&file, &config.endpoint, None).await
    } else {
        orchestrator.upload_file(&file, &config.endpoint, None).await
    };

    done.store(true, Ordering::SeqCst);
    if let Some(keyboard) = keyboard {
        keyboard.await??;
    }
    events.abort();

    match outcome.context("Upload failed")? {
        UploadOutcome::Completed { url } => println!("Uploaded: {}", url),
        UploadOutcome::Paused => println!("Paused. Run again to resume."),
        UploadOutcome::Cancelled => println!("Cancelled."),
    }

    Ok(())
}

fn handle_keyboard(
    orchestrator: Arc<UploadOrchestrator>,
    file_id: FileId,
    done: Arc<AtomicBool>,
    handle: Handle,
) -> anyhow::Result<()> {
    enable_raw_mode()?;

    let result = (|| -> anyhow::Result<()> {
        while !done.load(Ordering::SeqCst) {
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }

            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind != KeyEventKind::Press {
                    continue;
                }

                match code {
                    KeyCode::Char('p') => {
                        orchestrator.pause_upload(&file_id);
                    }
                    KeyCode::Char('c') => {
                        handle.block_on(orchestrator.cancel_upload(&file_id))?;
                    }
                    KeyCode::Char('q') => {
                        orchestrator.pause_upload(&file_id);
                        break;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    })();

    disable_raw_mode()?;
    result
}

async fn print_events(mut event_rx: broadcast::Receiver<UploadEvent>) {
    loop {
        match event_rx.recv().await {
            Ok(UploadEvent::Progress { progress, .. }) => {
                print!("{}\r\n", format_progress(&progress));
            }
            Ok(UploadEvent::Failed { file_id, error }) => {
                print!("Upload {} failed: {}\r\n", file_id, error);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use taskweave_core::event::{EngineEvent, EventBus};

/// JSONL event journal.
///
/// Writes every engine event at or below the configured level to
/// `{log_dir}/{timestamp}.jsonl`, one JSON object per line, flushing after
/// each entry so a crash loses nothing already written.
pub struct EventJournal {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a EngineEvent,
}

impl EventJournal {
    /// `level`: 1 = lifecycle, 2 = node transitions, 3 = task detail.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Subscribe now and write in the background until `cancel` fires.
    ///
    /// Subscribing happens before this returns, so events published after
    /// the call are never missed. Events still queued at cancellation are
    /// written before the task exits.
    pub fn spawn(self, bus: &Arc<EventBus>, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: Receiver<EngineEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create journal directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self.log_dir.join(format!("{}.jsonl", timestamp));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open journal");
                return;
            }
        };
        info!(path = %path.display(), level = self.level, "Event journal started");

        let mut writer = BufWriter::new(file);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    loop {
                        match rx.try_recv() {
                            Ok(event) => {
                                if !self.write(&mut writer, &event).await {
                                    break;
                                }
                            }
                            Err(TryRecvError::Lagged(n)) => {
                                debug!(skipped = n, "Journal lagged, skipped events");
                            }
                            Err(_) => break,
                        }
                    }
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        if !self.write(&mut writer, &event).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Journal lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, journal stopping");
                        break;
                    }
                },
            }
        }

        writer.flush().await.ok();
        debug!(path = %path.display(), "Event journal finished");
    }

    /// Returns false once the file can no longer be written.
    async fn write(&self, writer: &mut BufWriter<tokio::fs::File>, event: &EngineEvent) -> bool {
        let Some(line) = self.entry_line(event) else {
            return true;
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write journal entry");
            return false;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "Failed to flush journal");
        }
        true
    }

    /// Serialized line for `event`, or `None` if filtered by level.
    fn entry_line(&self, event: &EngineEvent) -> Option<String> {
        if event.level() > self.level {
            return None;
        }
        let entry = JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        serde_json::to_string(&entry).ok().map(|json| format!("{}\n", json))
    }
}

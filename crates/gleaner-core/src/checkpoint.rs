//! Append-only JSON Lines checkpoint log.
//!
//! Every terminal transition appends one line
//! `{"checksum": "<sha256>", "entry": {...}}` and fsyncs it. On reload the
//! last valid line per record id wins; lines that fail to parse or whose
//! checksum does not match (a write torn by a crash) are discarded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::models::{CheckpointEntry, compute_hash};
use crate::traits::CheckpointStore;

#[derive(Serialize, Deserialize)]
struct StoredLine {
    checksum: String,
    entry: serde_json::Value,
}

impl StoredLine {
    fn seal(entry: &CheckpointEntry) -> Result<Self, AppError> {
        let entry = serde_json::to_value(entry)?;
        Ok(Self {
            checksum: compute_hash(&entry.to_string()),
            entry,
        })
    }

    fn open(self) -> Option<CheckpointEntry> {
        if compute_hash(&self.entry.to_string()) != self.checksum {
            return None;
        }
        serde_json::from_value(self.entry).ok()
    }
}

#[derive(Default)]
struct LogState {
    index: HashMap<String, CheckpointEntry>,
    writer: Option<File>,
    /// The file ends in a partial line; terminate it before appending.
    needs_newline: bool,
}

/// File-backed [`CheckpointStore`].
#[derive(Clone)]
pub struct JsonlCheckpointStore {
    path: PathBuf,
    state: Arc<Mutex<LogState>>,
}

impl JsonlCheckpointStore {
    /// Open (and read) the log at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            state: Arc::new(Mutex::new(LogState::default())),
        };
        store.reload().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, action: &str, e: impl std::fmt::Display) -> AppError {
        AppError::CheckpointError(format!("{action} {}: {e}", self.path.display()))
    }

    async fn reload(&self) -> Result<HashMap<String, CheckpointEntry>, AppError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(self.io_error("reading", e)),
        };

        let text = String::from_utf8_lossy(&bytes);
        let mut index = HashMap::new();
        let mut discarded = 0usize;

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<StoredLine>(line)
                .ok()
                .and_then(StoredLine::open);
            match entry {
                Some(entry) => {
                    index.insert(entry.record_id.clone(), entry);
                }
                None => {
                    discarded += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        "Discarding corrupt checkpoint line"
                    );
                }
            }
        }

        if discarded > 0 {
            tracing::warn!(
                path = %self.path.display(),
                discarded,
                kept = index.len(),
                "Checkpoint log contained partial writes"
            );
        }

        let mut state = self.state.lock().await;
        state.index = index.clone();
        state.writer = None;
        state.needs_newline = !bytes.is_empty() && !bytes.ends_with(b"\n");
        Ok(index)
    }

    /// Latest entry per record, ordered by record id.
    pub async fn entries(&self) -> Vec<CheckpointEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.index.values().cloned().collect();
        entries.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        entries
    }

    async fn ensure_parent(&self) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("creating directory for", e))?;
        }
        Ok(())
    }

    async fn append(&self, state: &mut LogState, line: &str) -> Result<(), AppError> {
        if state.writer.is_none() {
            self.ensure_parent().await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.io_error("opening", e))?;
            state.writer = Some(file);
        }

        let prefix = if state.needs_newline { "\n" } else { "" };
        let payload = format!("{prefix}{line}\n");

        let Some(writer) = state.writer.as_mut() else {
            return Err(self.io_error("writing", "log not open"));
        };
        writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| self.io_error("writing", e))?;
        writer
            .sync_data()
            .await
            .map_err(|e| self.io_error("syncing", e))?;
        state.needs_newline = false;
        Ok(())
    }
}

impl CheckpointStore for JsonlCheckpointStore {
    async fn load(&self) -> Result<HashMap<String, CheckpointEntry>, AppError> {
        self.reload().await
    }

    async fn upsert(&self, entry: &CheckpointEntry) -> Result<(), AppError> {
        if !entry.status.is_terminal() {
            return Err(AppError::CheckpointError(format!(
                "refusing to checkpoint '{}' in non-terminal state {}",
                entry.record_id, entry.status
            )));
        }
        let line = serde_json::to_string(&StoredLine::seal(entry)?)?;
        let mut state = self.state.lock().await;
        self.append(&mut state, &line).await?;
        state.index.insert(entry.record_id.clone(), entry.clone());
        Ok(())
    }

    async fn is_done(&self, record_id: &str) -> Result<bool, AppError> {
        let state = self.state.lock().await;
        Ok(state.index.get(record_id).is_some_and(CheckpointEntry::is_done))
    }

    /// Rewrite the log to one line per record via temp file + rename.
    async fn compact(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;

        let mut entries: Vec<_> = state.index.values().collect();
        entries.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(&StoredLine::seal(entry)?)?);
            body.push('\n');
        }

        self.ensure_parent().await?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut tmp = File::create(&tmp_path)
                .await
                .map_err(|e| self.io_error("creating temp file for", e))?;
            tmp.write_all(body.as_bytes())
                .await
                .map_err(|e| self.io_error("writing temp file for", e))?;
            tmp.sync_all()
                .await
                .map_err(|e| self.io_error("syncing temp file for", e))?;
        }

        state.writer = None;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.io_error("replacing", e))?;
        state.needs_newline = false;

        tracing::debug!(path = %self.path.display(), records = state.index.len(), "Checkpoint log compacted");
        Ok(())
    }
}

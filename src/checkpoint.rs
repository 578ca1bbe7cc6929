//! Durable checkpoint store.
//!
//! One reader-writer lock owns the checkpoint; every other component sees a
//! snapshot by value. Saves go through a temp file and an atomic rename so a
//! crash mid-write never leaves a corrupt checkpoint behind.

use crate::error::Result;
use crate::models::Checkpoint;
use chrono::Utc;
use parking_lot::RwLock;
use std::path::PathBuf;
use tracing::warn;

pub struct CheckpointStore {
    path: PathBuf,
    enabled: bool,
    state: RwLock<Checkpoint>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            path: path.into(),
            enabled,
            state: RwLock::new(Checkpoint::fresh()),
        }
    }

    /// Load the checkpoint file. A missing file starts fresh; a file that
    /// fails to parse is treated the same way.
    pub fn load(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.state.write() = Checkpoint::fresh();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Checkpoint>(&raw) {
            Ok(checkpoint) => *self.state.write() = checkpoint,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint file unreadable, starting fresh");
                *self.state.write() = Checkpoint::fresh();
            }
        }
        Ok(())
    }

    /// Persist the current state, stamping `last_updated`.
    pub fn save(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let snapshot = {
            let mut state = self.state.write();
            state.last_updated = Utc::now();
            state.clone()
        };

        let json = serde_json::to_string_pretty(&snapshot)
            .expect("checkpoint serialization cannot fail");

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644))?;
        }

        Ok(())
    }

    pub fn update_progress(&self, offset: usize, total: usize, processed: usize) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        state.offset = offset;
        state.total = total;
        state.processed = processed;
    }

    pub fn update_mode(&self, mode: &str, date: &str) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        state.mode = mode.to_string();
        state.last_data_date = date.to_string();
    }

    pub fn record_failed(&self, key: impl Into<String>) {
        if !self.enabled {
            return;
        }
        self.state.write().failed_records.push(key.into());
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.state.read().clone()
    }

    pub fn offset(&self) -> usize {
        self.state.read().offset
    }

    pub fn reset(&self) {
        if !self.enabled {
            return;
        }
        *self.state.write() = Checkpoint::fresh();
    }
}

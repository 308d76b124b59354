use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::credential::Credential;
use crate::dedup::DedupStore;
use crate::pager::Backfill;

/// Default state file path.
pub const STATE_PATH: &str = "monitor_state.json";

/// Everything the monitor must remember across restarts. Owned by the
/// monitor loop and flushed after every change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(default)]
    pub dedup: DedupStore,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Older sales still to be read after a pass hit its page ceiling.
    #[serde(default)]
    pub backfill: Option<Backfill>,
}

/// Durable home of [`MonitorState`].
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, falling back to an empty state when the file is absent or
    /// unreadable. A corrupt file is moved aside to `<path>.corrupt`.
    pub fn load(&self) -> MonitorState {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state at {}, starting fresh", self.path.display());
                return MonitorState::default();
            }
            Err(e) => {
                error!(
                    kind = "StateCorruption",
                    "Could not read {}: {e}. Starting from empty state; recent sales may be re-notified",
                    self.path.display()
                );
                return MonitorState::default();
            }
        };

        match serde_json::from_str::<MonitorState>(&contents) {
            Ok(state) => {
                info!(
                    "Loaded {} previously seen sales from {}",
                    state.dedup.len(),
                    self.path.display()
                );
                state
            }
            Err(e) => {
                let backup = self.corrupt_path();
                error!(
                    kind = "StateCorruption",
                    "Could not parse {}: {e}. Moving it to {} and starting from empty state; recent sales may be re-notified",
                    self.path.display(),
                    backup.display()
                );
                if let Err(e) = std::fs::rename(&self.path, &backup) {
                    error!("Failed to move corrupt state aside: {e}");
                }
                MonitorState::default()
            }
        }
    }

    /// Write state atomically (temp file + rename).
    pub fn save(&self, state: &MonitorState) -> Result<()> {
        let contents = serde_json::to_string(state).context("failed to serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".corrupt");
        PathBuf::from(name)
    }
}

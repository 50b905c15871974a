//! Polls the live config file for edits.
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::{debug, warn};

use crate::config::read_config_value;

/// Detects edits to the live config by comparing modification timestamps.
///
/// Unreadable or syntactically invalid files never count as a change, so a half-saved
/// config cannot knock the supervisor over.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last_seen: Option<SystemTime>,
    last_rejected: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Creates a watcher that has not observed the file yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seen: None,
            last_rejected: None,
        }
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once per observed change of the file's modification time.
    pub fn poll_changed(&mut self) -> bool {
        let modified = match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!("Cannot stat config {}: {err}", self.path.display());
                return false;
            }
        };

        if self.last_seen == Some(modified) {
            return false;
        }

        if let Err(err) = read_config_value(&self.path) {
            if self.last_rejected != Some(modified) {
                warn!("Ignoring config change: {err}");
                self.last_rejected = Some(modified);
            }
            return false;
        }

        debug!("Config {} changed", self.path.display());
        self.last_seen = Some(modified);
        self.last_rejected = None;
        true
    }
}

//! Carries a prior install's configuration into the current layout.
//!
//! Every destructive write is preceded by a verified backup of the file it replaces.
use chrono::Local;
use dialoguer::Select;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{deploy::unique_path, error::MigrationError};

/// What a migration attempt did to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationAction {
    Copied,
    Merged,
    Skipped,
    Overwritten,
}

/// Outcome of one [`ConfigMigrator::migrate`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub migrated: bool,
    pub source_path: Option<PathBuf>,
    pub destination_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub action: MigrationAction,
    pub errors: Vec<String>,
}

impl MigrationResult {
    fn skipped(source: Option<&Path>, destination: &Path) -> Self {
        Self {
            migrated: false,
            source_path: source.map(Path::to_path_buf),
            destination_path: destination.to_path_buf(),
            backup_path: None,
            action: MigrationAction::Skipped,
            errors: Vec::new(),
        }
    }

    /// A migration that could not run; the destination is left as it was.
    pub fn failed(source: Option<&Path>, destination: &Path, error: &MigrationError) -> Self {
        Self::skipped(source, destination).with_error(error.to_string())
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }
}

/// Operator's answer when both a prior and a current config exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConflictChoice {
    Overwrite,
    Merge,
    Skip,
}

/// Asks the operator how to resolve a config conflict.
pub trait ConflictPrompt {
    fn choose(&self, prior: &Path, current: &Path) -> io::Result<ConflictChoice>;
}

/// Interactive terminal prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl ConflictPrompt for TerminalPrompt {
    fn choose(&self, prior: &Path, current: &Path) -> io::Result<ConflictChoice> {
        let choices = [
            "Overwrite the current config with the prior one",
            "Merge (current values win, missing keys come from the prior config)",
            "Skip (keep the current config unchanged)",
        ];

        let selection = Select::new()
            .with_prompt(format!(
                "Both {} and {} exist. How should they be reconciled?",
                prior.display(),
                current.display()
            ))
            .items(&choices)
            .default(1)
            .interact()
            .map_err(|err| io::Error::other(err.to_string()))?;

        Ok(match selection {
            0 => ConflictChoice::Overwrite,
            1 => ConflictChoice::Merge,
            _ => ConflictChoice::Skip,
        })
    }
}

/// Knobs for [`ConfigMigrator::migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    pub interactive: bool,
    pub force_overwrite: bool,
    /// When false, any action that would overwrite the destination is skipped instead.
    pub backup: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            interactive: false,
            force_overwrite: false,
            backup: true,
        }
    }
}

pub struct ConfigMigrator {
    prompt: Box<dyn ConflictPrompt>,
}

impl Default for ConfigMigrator {
    fn default() -> Self {
        Self::new(Box::new(TerminalPrompt))
    }
}

impl ConfigMigrator {
    pub fn new(prompt: Box<dyn ConflictPrompt>) -> Self {
        Self { prompt }
    }

    /// Migrates `prior` onto `destination` according to `options`.
    ///
    /// A corrupt prior config fails with [`MigrationError::Corrupt`] and is never modified.
    pub fn migrate(
        &self,
        prior: Option<&Path>,
        destination: &Path,
        options: MigrationOptions,
    ) -> Result<MigrationResult, MigrationError> {
        let Some(prior) = prior.filter(|path| path.is_file()) else {
            debug!("No prior config found; nothing to migrate");
            return Ok(MigrationResult::skipped(None, destination));
        };

        if prior == destination {
            return Ok(MigrationResult::skipped(Some(prior), destination));
        }

        let prior_value = read_json(prior)?;

        if !destination.exists() {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|source| MigrationError::Write {
                    path: destination.to_path_buf(),
                    source,
                })?;
            }
            fs::copy(prior, destination).map_err(|source| MigrationError::Write {
                path: destination.to_path_buf(),
                source,
            })?;
            info!(
                "Copied prior config {} to {}",
                prior.display(),
                destination.display()
            );
            return Ok(MigrationResult {
                migrated: true,
                action: MigrationAction::Copied,
                ..MigrationResult::skipped(Some(prior), destination)
            });
        }

        let choice = if options.force_overwrite {
            ConflictChoice::Overwrite
        } else if options.interactive {
            match self.prompt.choose(prior, destination) {
                Ok(choice) => choice,
                Err(err) => {
                    warn!("Config conflict prompt failed: {err}");
                    return Ok(MigrationResult::skipped(Some(prior), destination)
                        .with_error(format!("prompt failed: {err}")));
                }
            }
        } else {
            return Ok(
                MigrationResult::skipped(Some(prior), destination).with_error(format!(
                    "{} already exists; kept it and ignored {} (use --overwrite-config or run interactively)",
                    destination.display(),
                    prior.display()
                )),
            );
        };

        if choice == ConflictChoice::Skip {
            return Ok(MigrationResult::skipped(Some(prior), destination));
        }

        if !options.backup {
            return Ok(
                MigrationResult::skipped(Some(prior), destination).with_error(format!(
                    "{choice} would replace {} but backups are disabled; left unchanged",
                    destination.display()
                )),
            );
        }

        match choice {
            ConflictChoice::Overwrite => self.overwrite(prior, destination),
            ConflictChoice::Merge => self.merge(prior, &prior_value, destination),
            ConflictChoice::Skip => Ok(MigrationResult::skipped(Some(prior), destination)),
        }
    }

    fn overwrite(
        &self,
        prior: &Path,
        destination: &Path,
    ) -> Result<MigrationResult, MigrationError> {
        let backup = backup_file(destination, "overwrite")?;
        fs::copy(prior, destination).map_err(|source| MigrationError::Write {
            path: destination.to_path_buf(),
            source,
        })?;

        info!(
            "Overwrote {} with {} (backup at {})",
            destination.display(),
            prior.display(),
            backup.display()
        );
        Ok(MigrationResult {
            migrated: true,
            backup_path: Some(backup),
            action: MigrationAction::Overwritten,
            ..MigrationResult::skipped(Some(prior), destination)
        })
    }

    fn merge(
        &self,
        prior: &Path,
        prior_value: &Value,
        destination: &Path,
    ) -> Result<MigrationResult, MigrationError> {
        let current = read_json(destination)?;
        let merged = deep_merge(&current, prior_value);

        let backup = backup_file(destination, "merge")?;
        write_json(destination, &merged)?;

        info!(
            "Merged {} into {} (backup at {})",
            prior.display(),
            destination.display(),
            backup.display()
        );
        Ok(MigrationResult {
            migrated: true,
            backup_path: Some(backup),
            action: MigrationAction::Merged,
            ..MigrationResult::skipped(Some(prior), destination)
        })
    }
}

/// Merges `secondary` into `primary`; `primary` wins every conflict.
///
/// Objects merge recursively. Any other value, arrays included, is taken whole from
/// `primary` when it has the key.
pub fn deep_merge(primary: &Value, secondary: &Value) -> Value {
    match (primary, secondary) {
        (Value::Object(primary_map), Value::Object(secondary_map)) => {
            let mut merged = primary_map.clone();
            for (key, secondary_value) in secondary_map {
                match merged.get_mut(key) {
                    Some(existing) => {
                        let combined = deep_merge(existing, secondary_value);
                        *existing = combined;
                    }
                    None => {
                        merged.insert(key.clone(), secondary_value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => primary.clone(),
    }
}

/// Copies `path` to `<path>.backup-<label>-<timestamp>` and verifies the copy byte for byte.
pub fn backup_file(path: &Path, label: &str) -> Result<PathBuf, MigrationError> {
    let original = fs::read(path).map_err(|source| MigrationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let backup = unique_path(&path.with_file_name(format!("{name}.backup-{label}-{stamp}")));

    fs::write(&backup, &original).map_err(|source| MigrationError::Write {
        path: backup.clone(),
        source,
    })?;

    let written = fs::read(&backup).map_err(|source| MigrationError::Unreadable {
        path: backup.clone(),
        source,
    })?;
    if written.len() != original.len() || Sha256::digest(&written) != Sha256::digest(&original) {
        return Err(MigrationError::BackupMismatch {
            path: path.to_path_buf(),
            backup,
        });
    }

    debug!("Backed up {} to {}", path.display(), backup.display());
    Ok(backup)
}

/// First existing legacy config that is not `destination` itself.
pub fn detect_prior_install(candidates: &[PathBuf], destination: &Path) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|candidate| candidate.is_file() && candidate.as_path() != destination)
        .cloned()
}

fn read_json(path: &Path) -> Result<Value, MigrationError> {
    let raw = fs::read_to_string(path).map_err(|source| MigrationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| MigrationError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json(path: &Path, value: &Value) -> Result<(), MigrationError> {
    let write_err = |source| MigrationError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut rendered = serde_json::to_string_pretty(value)
        .map_err(|err| write_err(io::Error::other(err)))?;
    rendered.push('\n');

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, rendered).map_err(write_err)?;
    fs::rename(&staging, path).map_err(write_err)
}

//! Version markers, the install manifest, and upgrade decisions.
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fs, io,
    path::{Path, PathBuf},
};
use strum_macros::{AsRefStr, Display};
use tracing::debug;

use crate::error::DeploymentError;

/// Record of one successful deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationManifest {
    pub version: Version,
    pub installed_at: DateTime<Utc>,
    pub source_commit: String,
    pub runtime_version: String,
    pub platform: String,
    pub total_files: u64,
    pub total_size_bytes: u64,
}

/// How the installed version relates to the source version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VersionComparison {
    /// Nothing installed yet.
    NotInstalled,
    /// Installed version is older than the source.
    Older,
    /// Installed version equals the source.
    Same,
    /// Installed version is newer than the source.
    Newer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub upgrade_available: bool,
    pub comparison: VersionComparison,
}

/// Compares an installed manifest against the source version.
pub fn compare(installed: Option<&InstallationManifest>, source: &Version) -> UpgradeStatus {
    compare_versions(installed.map(|manifest| &manifest.version), source)
}

/// Semantic comparison; a missing install is never reported as an upgrade.
pub fn compare_versions(installed: Option<&Version>, source: &Version) -> UpgradeStatus {
    let comparison = match installed.map(|installed| installed.cmp(source)) {
        None => VersionComparison::NotInstalled,
        Some(Ordering::Less) => VersionComparison::Older,
        Some(Ordering::Equal) => VersionComparison::Same,
        Some(Ordering::Greater) => VersionComparison::Newer,
    };

    UpgradeStatus {
        upgrade_available: comparison == VersionComparison::Older,
        comparison,
    }
}

/// Reads and writes the version marker and the manifest.
#[derive(Debug, Clone)]
pub struct VersionTracker {
    marker_path: PathBuf,
    manifest_path: PathBuf,
}

impl VersionTracker {
    pub fn new(marker_path: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_path: marker_path.into(),
            manifest_path: manifest_path.into(),
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Version in the plain-text marker, if one has been written.
    pub fn read_marker(&self) -> Result<Option<Version>, DeploymentError> {
        let raw = match fs::read_to_string(&self.marker_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let value = raw.trim();
        Version::parse(value)
            .map(Some)
            .map_err(|source| DeploymentError::InvalidVersion {
                value: value.to_string(),
                path: self.marker_path.clone(),
                source,
            })
    }

    pub fn write_marker(&self, version: &Version) -> Result<(), DeploymentError> {
        if let Some(parent) = self.marker_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.marker_path, format!("{version}\n"))?;
        Ok(())
    }

    /// The current manifest, or `None` when nothing is installed.
    pub fn read_manifest(&self) -> Result<Option<InstallationManifest>, DeploymentError> {
        read_manifest_file(&self.manifest_path)
    }

    /// Replaces the manifest in a single rename.
    pub fn write_manifest(&self, manifest: &InstallationManifest) -> Result<(), DeploymentError> {
        let rendered = serde_json::to_string_pretty(manifest).map_err(|source| {
            DeploymentError::Manifest {
                path: self.manifest_path.clone(),
                source,
            }
        })?;

        if let Some(parent) = self.manifest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self.manifest_path.with_extension("json.tmp");
        fs::write(&staging, rendered)?;
        fs::rename(&staging, &self.manifest_path)?;

        debug!(
            "Wrote manifest for version {} to {}",
            manifest.version,
            self.manifest_path.display()
        );
        Ok(())
    }

    /// Removes the manifest so the deployment is no longer considered current.
    pub fn remove_manifest(&self) -> Result<(), DeploymentError> {
        match fs::remove_file(&self.manifest_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Compares the installed manifest against `source`.
    pub fn check(&self, source: &Version) -> Result<UpgradeStatus, DeploymentError> {
        let installed = self.read_manifest()?;
        Ok(compare(installed.as_ref(), source))
    }
}

/// Parses a manifest file; a missing file yields `None`.
pub fn read_manifest_file(path: &Path) -> Result<Option<InstallationManifest>, DeploymentError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| DeploymentError::Manifest {
            path: path.to_path_buf(),
            source,
        })
}

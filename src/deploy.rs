//! Frozen deployment of the application's source packages.
//!
//! A deployment is only current once its manifest exists. The manifest is removed before
//! the old snapshot is touched and written again after verification, so a half-copied
//! directory is never reported as installed.
use chrono::{Local, Utc};
use regex::Regex;
use semver::Version;
use std::{
    env, fs, io,
    path::{Component, Path, PathBuf},
    process::Command,
    sync::LazyLock,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{
        DEFAULT_ENTRY_POINT, ENV_ENTRY_POINT, ENV_SOURCE_ROOT, MANIFEST_FILE_NAME,
        PACKAGE_MARKER_FILE, PROJECT_FILE_NAME, REQUIREMENTS_FILE_NAME, VERSION_MARKER_NAME,
    },
    error::DeploymentError,
    paths::InstallPaths,
    version::{InstallationManifest, VersionComparison, VersionTracker},
};

/// Path segments never copied into a deployment.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "__pycache__",
    "*.pyc",
    "*.pyo",
    ".git",
    ".hg",
    ".svn",
    "tests",
    "test",
    "*.egg-info",
    "*.dist-info",
    "build",
    "dist",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".tox",
    ".venv",
    ".DS_Store",
];

static PROJECT_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*version\s*=\s*["']([^"']+)["']"#).expect("project version pattern is valid")
});

/// The application checkout a deployment is taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSource {
    pub root: PathBuf,
    /// Package directories, each containing the package marker.
    pub packages: Vec<PathBuf>,
    pub entry_point: PathBuf,
    pub requirements: Option<PathBuf>,
    pub version: Version,
    pub commit: String,
}

impl AppSource {
    /// Locates the source from `WARDEN_SOURCE_ROOT` or the nearest project ancestor of the
    /// working directory. `WARDEN_ENTRY_POINT` overrides the entry point.
    pub fn discover() -> Result<Self, DeploymentError> {
        let root = match env::var_os(ENV_SOURCE_ROOT).filter(|value| !value.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => {
                let cwd = env::current_dir()?;
                let project_root = cwd
                    .ancestors()
                    .find(|dir| dir.join(PROJECT_FILE_NAME).is_file())
                    .map(Path::to_path_buf);
                project_root.ok_or(DeploymentError::SourceNotFound { path: cwd })?
            }
        };

        let mut source = Self::at(&root)?;
        if let Some(entry) = env::var_os(ENV_ENTRY_POINT).filter(|value| !value.is_empty()) {
            let entry = PathBuf::from(entry);
            source.entry_point = if entry.is_absolute() {
                entry
            } else {
                root.join(entry)
            };
        }
        Ok(source)
    }

    /// Reads the source at an explicit root.
    pub fn at(root: &Path) -> Result<Self, DeploymentError> {
        if !root.is_dir() {
            return Err(DeploymentError::SourceNotFound {
                path: root.to_path_buf(),
            });
        }

        let packages = find_packages(root, &ExclusionFilter::default())?;
        if packages.is_empty() {
            return Err(DeploymentError::NoPackages {
                root: root.to_path_buf(),
            });
        }

        let requirements = Some(root.join(REQUIREMENTS_FILE_NAME)).filter(|path| path.is_file());

        Ok(Self {
            root: root.to_path_buf(),
            packages,
            entry_point: root.join(DEFAULT_ENTRY_POINT),
            requirements,
            version: read_source_version(root)?,
            commit: source_commit(root),
        })
    }
}

/// Directories under `src/` (or the root when there is no `src/`) holding the package marker.
fn find_packages(root: &Path, filter: &ExclusionFilter) -> Result<Vec<PathBuf>, DeploymentError> {
    let src = root.join("src");
    let search = if src.is_dir() { src } else { root.to_path_buf() };

    let mut packages = Vec::new();
    for entry in fs::read_dir(&search)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if !entry.file_type()?.is_dir() || filter.matches_segment(&name.to_string_lossy()) {
            continue;
        }
        if path.join(PACKAGE_MARKER_FILE).is_file() {
            packages.push(path);
        }
    }

    packages.sort();
    Ok(packages)
}

/// Version from a `VERSION` file, falling back to the project file.
fn read_source_version(root: &Path) -> Result<Version, DeploymentError> {
    let version_err = |reason: String| DeploymentError::SourceVersion {
        root: root.to_path_buf(),
        reason,
    };

    let raw = match fs::read_to_string(root.join(VERSION_MARKER_NAME)) {
        Ok(raw) => raw.trim().to_string(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let project = fs::read_to_string(root.join(PROJECT_FILE_NAME)).map_err(|err| {
                version_err(format!("no {VERSION_MARKER_NAME} file and {PROJECT_FILE_NAME} unreadable: {err}"))
            })?;
            PROJECT_VERSION
                .captures(&project)
                .map(|caps| caps[1].to_string())
                .ok_or_else(|| version_err(format!("no version in {PROJECT_FILE_NAME}")))?
        }
        Err(err) => return Err(err.into()),
    };

    lenient_version(&raw).ok_or_else(|| version_err(format!("'{raw}' is not a semantic version")))
}

/// Parses `1`, `1.2` and `1.2.3`-style versions, padding missing components with zero.
fn lenient_version(raw: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let mut parts = raw.split('.').map(|part| part.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    if parts.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, patch))
}

fn source_commit(root: &Path) -> String {
    match Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(root)
        .output()
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => "unknown".to_string(),
    }
}

/// Path-segment exclusion: exact names or `*suffix` wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionFilter {
    patterns: Vec<String>,
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSIONS.iter().copied())
    }
}

impl ExclusionFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches_segment(&self, segment: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| match pattern.strip_prefix('*') {
                Some(suffix) => segment.ends_with(suffix),
                None => segment == pattern,
            })
    }

    /// True when any segment of `relative` matches, which excludes the whole subtree.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative.components().any(|component| match component {
            Component::Normal(segment) => self.matches_segment(&segment.to_string_lossy()),
            _ => false,
        })
    }
}

/// Result of [`PackageDeployer::deploy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The installed manifest already matches the source version.
    UpToDate { version: Version },
    /// A new snapshot was deployed.
    Deployed {
        manifest: InstallationManifest,
        /// Backup of the previous deployment, when there was one.
        backup: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct CopyStats {
    files: u64,
    bytes: u64,
}

/// Copies a filtered snapshot of an [`AppSource`] into the install directory.
#[derive(Debug, Clone)]
pub struct PackageDeployer {
    source: AppSource,
    deploy_dir: PathBuf,
    backup_dir: PathBuf,
    tracker: VersionTracker,
    filter: ExclusionFilter,
    runtime_version: String,
}

impl PackageDeployer {
    pub fn new(source: AppSource, paths: &InstallPaths) -> Self {
        Self {
            source,
            deploy_dir: paths.deploy_dir.clone(),
            backup_dir: paths.backup_dir.clone(),
            tracker: VersionTracker::new(paths.version_marker(), paths.manifest_file()),
            filter: ExclusionFilter::default(),
            runtime_version: "unknown".to_string(),
        }
    }

    pub fn with_filter(mut self, filter: ExclusionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Runtime version recorded in the manifest.
    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }

    pub fn source(&self) -> &AppSource {
        &self.source
    }

    pub fn tracker(&self) -> &VersionTracker {
        &self.tracker
    }

    /// Deploys the source unless the installed manifest already has its version.
    pub fn deploy(&self, force: bool) -> Result<DeployOutcome, DeploymentError> {
        let installed = self.tracker.read_manifest()?;
        let status = crate::version::compare(installed.as_ref(), &self.source.version);

        match status.comparison {
            VersionComparison::Same if !force => {
                info!(
                    "Version {} already deployed; skipping",
                    self.source.version
                );
                return Ok(DeployOutcome::UpToDate {
                    version: self.source.version.clone(),
                });
            }
            VersionComparison::Newer => warn!(
                "Installed version is newer than source {}; deploying the source anyway",
                self.source.version
            ),
            _ => {}
        }

        let backup = self.backup_existing(installed.as_ref().map(|m| &m.version))?;
        self.tracker.remove_manifest()?;

        if self.deploy_dir.exists() {
            debug!("Removing previous deployment at {}", self.deploy_dir.display());
            fs::remove_dir_all(&self.deploy_dir)?;
        }

        let stats = match self.copy_snapshot() {
            Ok(stats) => stats,
            Err(err) => {
                self.discard_partial();
                return Err(err);
            }
        };

        self.tracker.write_marker(&self.source.version)?;

        if let Err(err) = self.verify() {
            self.discard_partial();
            return Err(err);
        }

        let manifest = InstallationManifest {
            version: self.source.version.clone(),
            installed_at: Utc::now(),
            source_commit: self.source.commit.clone(),
            runtime_version: self.runtime_version.clone(),
            platform: format!("{}-{}", env::consts::OS, env::consts::ARCH),
            total_files: stats.files,
            total_size_bytes: stats.bytes,
        };
        self.tracker.write_manifest(&manifest)?;

        info!(
            "Deployed version {} ({} files, {} bytes) to {}",
            manifest.version,
            manifest.total_files,
            manifest.total_size_bytes,
            self.deploy_dir.display()
        );
        Ok(DeployOutcome::Deployed { manifest, backup })
    }

    /// Checks that the entry point, the version marker and every package marker exist.
    pub fn verify(&self) -> Result<(), DeploymentError> {
        let mut critical = vec![self.tracker.marker_path().to_path_buf()];
        if let Some(name) = self.source.entry_point.file_name() {
            critical.push(self.deploy_dir.join(name));
        }
        for package in &self.source.packages {
            if let Some(name) = package.file_name() {
                critical.push(self.deploy_dir.join(name).join(PACKAGE_MARKER_FILE));
            }
        }

        let missing: Vec<PathBuf> = critical.into_iter().filter(|path| !path.is_file()).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DeploymentError::VerificationFailed { missing })
        }
    }

    /// Copies the current deployment and manifest into a timestamped backup directory.
    fn backup_existing(
        &self,
        installed: Option<&Version>,
    ) -> Result<Option<PathBuf>, DeploymentError> {
        let manifest = self.tracker.manifest_path();
        if !self.deploy_dir.exists() && !manifest.exists() {
            return Ok(None);
        }

        let label = installed.map_or_else(|| "unknown".to_string(), Version::to_string);
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let target = unique_path(&self.backup_dir.join(format!("deploy-{label}-{stamp}")));

        let backup_err = |source| DeploymentError::Backup {
            path: self.deploy_dir.clone(),
            source,
        };

        if self.deploy_dir.exists() {
            copy_dir_all(&self.deploy_dir, &target).map_err(backup_err)?;
        } else {
            fs::create_dir_all(&target).map_err(backup_err)?;
        }
        if manifest.exists() {
            fs::copy(manifest, target.join(MANIFEST_FILE_NAME)).map_err(backup_err)?;
        }

        info!("Backed up previous deployment to {}", target.display());
        Ok(Some(target))
    }

    fn copy_snapshot(&self) -> Result<CopyStats, DeploymentError> {
        let mut stats = CopyStats::default();
        fs::create_dir_all(&self.deploy_dir)?;

        for package in &self.source.packages {
            let Some(name) = package.file_name() else {
                continue;
            };
            let base = package.parent().unwrap_or(package);
            self.copy_tree(package, &self.deploy_dir.join(name), base, &mut stats)?;
        }

        let mut loose_files = vec![self.source.entry_point.clone()];
        loose_files.extend(self.source.requirements.clone());
        for file in loose_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            if !file.is_file() {
                warn!("{} not found in source; skipping", file.display());
                continue;
            }
            stats.files += 1;
            stats.bytes += copy_file(&file, &self.deploy_dir.join(name))?;
        }

        Ok(stats)
    }

    fn copy_tree(
        &self,
        src: &Path,
        dest: &Path,
        base: &Path,
        stats: &mut CopyStats,
    ) -> Result<(), DeploymentError> {
        fs::create_dir_all(dest).map_err(|source| DeploymentError::Copy {
            path: dest.to_path_buf(),
            source,
        })?;

        let mut entries = fs::read_dir(src)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let relative = path.strip_prefix(base).unwrap_or(&path);
            if self.filter.is_excluded(relative) {
                debug!("Excluding {}", relative.display());
                continue;
            }

            let file_type = entry.file_type()?;
            let target = dest.join(entry.file_name());
            if file_type.is_symlink() {
                debug!("Skipping symlink {}", path.display());
            } else if file_type.is_dir() {
                self.copy_tree(&path, &target, base, stats)?;
            } else if file_type.is_file() {
                stats.files += 1;
                stats.bytes += copy_file(&path, &target)?;
            }
        }

        Ok(())
    }

    fn discard_partial(&self) {
        if let Err(err) = fs::remove_dir_all(&self.deploy_dir)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(
                "Failed to remove partial deployment at {}: {err}",
                self.deploy_dir.display()
            );
        }
    }
}

fn copy_file(src: &Path, dest: &Path) -> Result<u64, DeploymentError> {
    fs::copy(src, dest).map_err(|source| DeploymentError::Copy {
        path: src.to_path_buf(),
        source,
    })
}

/// Recursively copies `src` to `dest` without filtering. Symlinks are skipped.
pub(crate) fn copy_dir_all(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// `path` itself, or `path-<n>` for the first `n` that does not exist yet.
pub(crate) fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let base = path.as_os_str().to_string_lossy().into_owned();
    (1..)
        .map(|n| PathBuf::from(format!("{base}-{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

//! Install layout and config locations.
use std::{
    env,
    path::{Path, PathBuf},
};

use crate::{
    constants::{
        APP_NAME, BACKUP_DIR_NAME, BIN_DIR_NAME, CONFIG_FILE_NAME, DEPLOY_DIR_NAME,
        ENV_CONFIG_HOME, ENV_CONFIG_PATH, LOG_DIR_NAME, MANIFEST_FILE_NAME, RUNTIME_DIR_NAME,
        SERVICE_STDERR_LOG, SERVICE_STDOUT_LOG, VERSION_MARKER_NAME,
    },
    error::InstallError,
};

/// Every directory and file the installer and supervisor touch.
///
/// Built once and handed to each component; nothing reads these locations from
/// ambient state after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    /// User home directory the layout was derived from.
    pub home: PathBuf,
    /// Install root holding everything except the live config.
    pub root: PathBuf,
    /// Runtime sandbox directory.
    pub runtime_dir: PathBuf,
    /// Deployed application snapshot.
    pub deploy_dir: PathBuf,
    /// Wrapper scripts and the supervisor snapshot.
    pub bin_dir: PathBuf,
    /// Service and child logs.
    pub log_dir: PathBuf,
    /// Timestamped backups of previous deployments.
    pub backup_dir: PathBuf,
    /// Directory containing the live config.
    pub config_dir: PathBuf,
    /// Live config file.
    pub config_file: PathBuf,
}

impl InstallPaths {
    /// Resolves the layout for the current user, honouring the environment overrides.
    ///
    /// Fails when the home directory is unknown instead of guessing a system-wide location.
    pub fn resolve() -> Result<Self, InstallError> {
        let home = home_dir()?;
        let mut paths = Self::from_home(&home);

        if let Some(base) = env::var_os(ENV_CONFIG_HOME).filter(|v| !v.is_empty()) {
            paths.config_dir = PathBuf::from(base).join(APP_NAME);
            paths.config_file = paths.config_dir.join(CONFIG_FILE_NAME);
        } else if let Some(base) = platform_config_base() {
            paths.config_dir = base.join(APP_NAME);
            paths.config_file = paths.config_dir.join(CONFIG_FILE_NAME);
        }

        if let Some(config) = env::var_os(ENV_CONFIG_PATH).filter(|v| !v.is_empty()) {
            let config = PathBuf::from(config);
            if let Some(parent) = config.parent() {
                paths.config_dir = parent.to_path_buf();
            }
            paths.config_file = config;
        }

        Ok(paths)
    }

    /// Builds the layout under an explicit home directory, ignoring the environment.
    pub fn from_home(home: &Path) -> Self {
        let root = if cfg!(windows) {
            env::var_os("LOCALAPPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("AppData").join("Local"))
                .join(APP_NAME)
        } else {
            home.join(".local/share").join(APP_NAME)
        };
        let config_dir = home.join(".config").join(APP_NAME);

        Self {
            home: home.to_path_buf(),
            runtime_dir: root.join(RUNTIME_DIR_NAME),
            deploy_dir: root.join(DEPLOY_DIR_NAME),
            bin_dir: root.join(BIN_DIR_NAME),
            log_dir: root.join(LOG_DIR_NAME),
            backup_dir: root.join(BACKUP_DIR_NAME),
            config_file: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
            root,
        }
    }

    /// Plain-text version marker inside the deployment.
    pub fn version_marker(&self) -> PathBuf {
        self.deploy_dir.join(VERSION_MARKER_NAME)
    }

    /// Machine-readable install manifest.
    pub fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    /// Where the native service manager sends the supervisor's stdout.
    pub fn service_stdout_log(&self) -> PathBuf {
        self.log_dir.join(SERVICE_STDOUT_LOG)
    }

    /// Where the native service manager sends the supervisor's stderr.
    pub fn service_stderr_log(&self) -> PathBuf {
        self.log_dir.join(SERVICE_STDERR_LOG)
    }

    /// Config locations used by earlier releases, most recent layout first.
    pub fn legacy_config_candidates(&self) -> Vec<PathBuf> {
        vec![
            self.root.join(CONFIG_FILE_NAME),
            self.home.join(format!(".{APP_NAME}")).join(CONFIG_FILE_NAME),
        ]
    }
}

fn home_dir() -> Result<PathBuf, InstallError> {
    let variable = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    env::var_os(variable)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .ok_or(InstallError::HomeUnavailable { variable })
}

fn platform_config_base() -> Option<PathBuf> {
    let var = if cfg!(windows) {
        "APPDATA"
    } else {
        "XDG_CONFIG_HOME"
    };
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

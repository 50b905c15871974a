//! Live configuration handling for warden.
//!
//! The live config is a JSON document owned by the operator. Only the `daemon` section
//! is interpreted here; every other key is carried through untouched.
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use crate::{
    constants::{
        DEFAULT_CONFIG_POLL_SECONDS, DEFAULT_HEALTH_CHECK_SECONDS, DEFAULT_HOST,
        DEFAULT_LOG_BACKUP_COUNT, DEFAULT_LOG_MAX_BYTES, DEFAULT_PORT,
    },
    error::ConfigError,
};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("env var pattern is valid")
});

/// Settings that drive the supervisor, read from the `daemon` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Whether the managed server should be running.
    pub enabled: bool,
    /// Bind host passed to the managed server.
    pub host: String,
    /// Bind port passed to the managed server.
    pub port: u16,
    /// Seconds between config polls.
    pub config_poll_seconds: u64,
    /// Seconds between liveness checks of the managed server.
    pub health_check_interval_seconds: u64,
    /// Optional file the child pid is written to.
    pub pid_file: Option<String>,
    /// Optional file the child's output is appended to.
    pub log_file: Option<String>,
    /// Rotation policy for `log_file`.
    pub log_rotation: LogRotation,
}

/// Size-based rotation policy for the child log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRotation {
    pub max_bytes: u64,
    pub backup_count: usize,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backup_count: DEFAULT_LOG_BACKUP_COUNT,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            config_poll_seconds: DEFAULT_CONFIG_POLL_SECONDS,
            health_check_interval_seconds: DEFAULT_HEALTH_CHECK_SECONDS,
            pid_file: None,
            log_file: None,
            log_rotation: LogRotation::default(),
        }
    }
}

impl DaemonConfig {
    /// Interval between config polls, never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_seconds.max(1))
    }

    /// Interval between liveness checks, never shorter than one second.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds.max(1))
    }

    /// `pid_file` with `~` and environment variables expanded.
    pub fn resolved_pid_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        self.pid_file.as_deref().map(expand_path).transpose()
    }

    /// `log_file` with `~` and environment variables expanded.
    pub fn resolved_log_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        self.log_file.as_deref().map(expand_path).transpose()
    }

    /// True when a change between `self` and `other` requires relaunching the child.
    pub fn launch_settings_differ(&self, other: &DaemonConfig) -> bool {
        self.host != other.host || self.port != other.port || self.log_file != other.log_file
    }
}

/// Reads the whole config document.
pub fn read_config_value(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the `daemon` section; an absent section yields the defaults (disabled).
pub fn load_daemon_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let value = read_config_value(path)?;
    daemon_config_from_value(path, &value)
}

/// Extracts the `daemon` section from an already parsed document.
pub fn daemon_config_from_value(
    path: &Path,
    value: &Value,
) -> Result<DaemonConfig, ConfigError> {
    match value.get("daemon") {
        None | Some(Value::Null) => Ok(DaemonConfig::default()),
        Some(section) => {
            serde_json::from_value(section.clone()).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Returns the explicit `daemon.enabled` flag if the document sets one.
pub fn explicit_enabled(value: &Value) -> Option<bool> {
    value
        .get("daemon")
        .and_then(|daemon| daemon.get("enabled"))
        .and_then(Value::as_bool)
}

/// The config written for a fresh install: safe defaults, enabled, with inline notes.
pub fn default_config_value() -> Value {
    let defaults = DaemonConfig {
        enabled: true,
        ..DaemonConfig::default()
    };

    json!({
        "_comment": "Managed by warden. Edit this file to control the background server; \
                     no start/stop commands are needed.",
        "daemon": {
            "_comment": "Set enabled to false to stop the server and true to start it. \
                         Changes are picked up within config_poll_seconds. host and port \
                         are passed to the server; changing them restarts it.",
            "enabled": defaults.enabled,
            "host": defaults.host,
            "port": defaults.port,
            "config_poll_seconds": defaults.config_poll_seconds,
            "health_check_interval_seconds": defaults.health_check_interval_seconds,
            "pid_file": null,
            "log_file": null,
            "log_rotation": {
                "max_bytes": defaults.log_rotation.max_bytes,
                "backup_count": defaults.log_rotation.backup_count,
            },
        },
    })
}

/// Writes a config document, replacing the target in one rename.
pub fn write_config_value(path: &Path, value: &Value) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut rendered = serde_json::to_string_pretty(value).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    rendered.push('\n');

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, rendered).map_err(write_err)?;
    fs::rename(&staging, path).map_err(write_err)
}

/// Expands a leading `~` and `$VAR`/`${VAR}` references in a path setting.
pub fn expand_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let mut missing = None;
    let expanded = ENV_VAR_PATTERN.replace_all(raw, |caps: &regex::Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    if let Some(variable) = missing {
        return Err(ConfigError::UndefinedVariable {
            value: raw.to_string(),
            variable,
        });
    }

    let expanded = expanded.into_owned();
    if let Some(rest) = expanded.strip_prefix('~') {
        let home_var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
        if let Some(home) = env::var_os(home_var) {
            let rest = rest.trim_start_matches(['/', '\\']);
            return Ok(PathBuf::from(home).join(rest));
        }
    }

    Ok(PathBuf::from(expanded))
}

//! Error handling for warden.
use std::{io, path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// Errors raised while reading or writing the live configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The config file is not valid JSON or has the wrong shape.
    #[error("Invalid JSON in config file {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_json::Error,
    },

    /// The config file could not be written.
    #[error("Failed to write config file {path}: {source}")]
    Write {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A `${VAR}` reference in a path setting names an undefined variable.
    #[error("Config value '{value}' references undefined environment variable '{variable}'")]
    UndefinedVariable {
        /// The raw config value.
        value: String,
        /// The missing variable.
        variable: String,
    },
}

/// Incompatible, missing, or broken runtime sandbox.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The host interpreter is older than the supported floor.
    #[error("Runtime version {found} is not supported; {required} or newer is required")]
    IncompatibleVersion {
        /// Version reported by the interpreter.
        found: semver::Version,
        /// Minimum supported version.
        required: semver::Version,
    },

    /// The interpreter could not be executed at all.
    #[error("Could not run interpreter '{interpreter}': {source}")]
    InterpreterUnavailable {
        /// Interpreter that was invoked.
        interpreter: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The interpreter ran but its version output was not understood.
    #[error("Could not determine runtime version from output '{0}'")]
    VersionUnreadable(String),

    /// The sandbox has not been created yet.
    #[error("Runtime sandbox not found at {path}; create it before resolving its executable")]
    Missing {
        /// Expected sandbox directory.
        path: PathBuf,
    },

    /// The sandbox directory exists but lacks its marker or executable.
    #[error("Runtime sandbox at {path} is incomplete or corrupt")]
    Corrupt {
        /// Sandbox directory.
        path: PathBuf,
    },

    /// The provisioning tool exited unsuccessfully.
    #[error("'{command}' failed with {status}: {stderr}")]
    CommandFailed {
        /// Human-readable command line.
        command: String,
        /// Exit status of the tool.
        status: ExitStatus,
        /// Captured stderr.
        stderr: String,
    },

    /// Filesystem error while preparing the sandbox.
    #[error("Runtime sandbox I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Copy, backup, or verification failure while deploying the application snapshot.
#[derive(Debug, Error)]
pub enum DeploymentError {
    /// The application source root does not exist.
    #[error("Application source root not found at {path}")]
    SourceNotFound {
        /// Source root that was searched.
        path: PathBuf,
    },

    /// No package directories were found under the source root.
    #[error("No packages (directories containing __init__.py) found under {root}")]
    NoPackages {
        /// Source root that was searched.
        root: PathBuf,
    },

    /// The source version could not be determined.
    #[error("Could not determine source version under {root}: {reason}")]
    SourceVersion {
        /// Source root.
        root: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Backing up the existing deployment failed.
    #[error("Failed to back up {path}: {source}")]
    Backup {
        /// Path being backed up.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Copying a file into the install directory failed.
    #[error("Failed to copy {path}: {source}")]
    Copy {
        /// Path being copied.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Critical files are missing after the copy.
    #[error("Deployment verification failed; missing critical files: {missing:?}")]
    VerificationFailed {
        /// Critical files that were not found.
        missing: Vec<PathBuf>,
    },

    /// The manifest could not be read or written.
    #[error("Manifest {path} could not be processed: {source}")]
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_json::Error,
    },

    /// The version marker holds something that is not a semantic version.
    #[error("Invalid version '{value}' in {path}: {source}")]
    InvalidVersion {
        /// The raw value.
        value: String,
        /// File that contained it.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: semver::Error,
    },

    /// Generic filesystem error.
    #[error("Deployment I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Unreadable or corrupt configuration encountered during migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Unreadable {
        /// Path that failed.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A config file is not valid JSON. The file is left untouched.
    #[error("Config {path} is corrupt and was left untouched: {source}")]
    Corrupt {
        /// Path that failed to parse.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_json::Error,
    },

    /// The backup copy did not match the file it was taken from.
    #[error("Backup {backup} does not match {path}; refusing to overwrite")]
    BackupMismatch {
        /// File that was backed up.
        path: PathBuf,
        /// Backup that failed verification.
        backup: PathBuf,
    },

    /// Writing the destination failed.
    #[error("Failed to write {path}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// Native service tool missing or a registration command failed.
#[derive(Debug, Error)]
pub enum ServiceRegistrationError {
    /// The platform's service tool is not on PATH.
    #[error("'{tool}' was not found on PATH. {remediation}")]
    ToolMissing {
        /// Tool that is missing.
        tool: String,
        /// What the operator should do about it.
        remediation: String,
    },

    /// A service tool exited unsuccessfully.
    #[error("'{command}' failed ({status}): {output}")]
    CommandFailed {
        /// Human-readable command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Combined stdout/stderr.
        output: String,
    },

    /// Writing the service definition failed.
    #[error("Failed to write service definition {path}: {source}")]
    Write {
        /// Definition path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Generic I/O error (running a tool, tailing logs).
    #[error("Service registration I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Spawn or stop failure in the supervisor.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The runtime executable does not exist.
    #[error("Runtime executable not found at {path}")]
    ExecutableMissing {
        /// Expected executable.
        path: PathBuf,
    },

    /// Spawning the managed process failed.
    #[error("Failed to spawn {executable}: {source}")]
    SpawnError {
        /// Executable that failed to start.
        executable: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Signalling or reaping the managed process failed.
    #[error("Failed to stop process {pid}: {source}")]
    StopError {
        /// Pid of the managed process.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Log or pid file handling failed.
    #[error("Process bookkeeping I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Launch settings could not be derived from the config.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Umbrella error for the install/uninstall workflows.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Runtime sandbox problem.
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    /// Deployment problem.
    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    /// Config migration problem.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Service registration problem.
    #[error(transparent)]
    Service(#[from] ServiceRegistrationError),

    /// Live config problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A precondition for installing is not met.
    #[error("{0}")]
    Precondition(String),

    /// The user's home directory could not be determined.
    #[error("Cannot locate the home directory: {variable} is not set")]
    HomeUnavailable {
        /// Environment variable that names the home directory on this platform.
        variable: &'static str,
    },

    /// Generic filesystem error.
    #[error("Install I/O failed at {path}: {source}")]
    Io {
        /// Path being processed.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    /// Operator-facing hint describing how to recover from this failure.
    pub fn remediation(&self) -> String {
        match self {
            InstallError::Environment(EnvironmentError::IncompatibleVersion {
                required, ..
            }) => format!(
                "Install Python {required} or newer and point WARDEN_PYTHON at it."
            ),
            InstallError::Environment(EnvironmentError::InterpreterUnavailable {
                interpreter,
                ..
            }) => format!(
                "Make sure '{}' is installed and on PATH, or set WARDEN_PYTHON.",
                interpreter.display()
            ),
            InstallError::Environment(_) => {
                "Re-run the install with --force-runtime to recreate the runtime sandbox."
                    .to_string()
            }
            InstallError::Deployment(DeploymentError::SourceNotFound { .. })
            | InstallError::Deployment(DeploymentError::NoPackages { .. }) => {
                "Run from the application checkout or set WARDEN_SOURCE_ROOT.".to_string()
            }
            InstallError::Deployment(_) => {
                "The previous deployment is preserved under the backups directory; \
                 run `warden restore <backup>` to bring it back."
                    .to_string()
            }
            InstallError::Migration(_) => {
                "Fix or remove the prior config file, then re-run the install.".to_string()
            }
            InstallError::Service(ServiceRegistrationError::ToolMissing {
                remediation,
                ..
            }) => remediation.clone(),
            InstallError::Service(_) => {
                "The application is installed; register the service manually or re-run \
                 the install once the service manager is available."
                    .to_string()
            }
            InstallError::Config(_) => {
                "Fix the JSON syntax of the config file and re-run the install.".to_string()
            }
            InstallError::HomeUnavailable { variable } => {
                format!("Set {variable} to the user's home directory, or set WARDEN_CONFIG and run as a regular user.")
            }
            InstallError::Precondition(_) | InstallError::Io { .. } => {
                "Check file permissions for the install directory.".to_string()
            }
        }
    }
}

/// Wraps an I/O error with the path it occurred at.
pub(crate) fn install_io(path: impl Into<PathBuf>, source: io::Error) -> InstallError {
    InstallError::Io {
        path: path.into(),
        source,
    }
}

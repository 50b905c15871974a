//! Constants and default values shared across the installer and supervisor.

use std::time::Duration;

// ============================================================================
// Naming
// ============================================================================

/// Name used for the install root, config directory, and registered service.
pub const APP_NAME: &str = "warden";

/// Reverse-DNS label for the macOS launch agent.
pub const LAUNCHD_LABEL: &str = "dev.warden.supervisor";

/// Unit file name for the Linux user service.
pub const SYSTEMD_UNIT_NAME: &str = "warden.service";

/// Service name registered with the Windows service wrapper.
pub const WINDOWS_SERVICE_NAME: &str = "Warden";

/// Name of the wrapper script generated for the managed server.
pub const SERVER_WRAPPER_NAME: &str = "warden-server";

// ============================================================================
// Environment Overrides
// ============================================================================

/// Overrides the live config file location.
pub const ENV_CONFIG_PATH: &str = "WARDEN_CONFIG";

/// Overrides the deployment source root.
pub const ENV_SOURCE_ROOT: &str = "WARDEN_SOURCE_ROOT";

/// Overrides the managed application's entry point.
pub const ENV_ENTRY_POINT: &str = "WARDEN_ENTRY_POINT";

/// Overrides the platform config base directory.
pub const ENV_CONFIG_HOME: &str = "WARDEN_CONFIG_HOME";

/// Overrides the system interpreter used to create the runtime sandbox.
pub const ENV_PYTHON: &str = "WARDEN_PYTHON";

// ============================================================================
// File System Layout
// ============================================================================

/// Live config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Directory holding the runtime sandbox.
pub const RUNTIME_DIR_NAME: &str = "runtime";

/// Directory holding the deployed application snapshot.
pub const DEPLOY_DIR_NAME: &str = "app";

/// Directory holding wrappers and the supervisor snapshot.
pub const BIN_DIR_NAME: &str = "bin";

/// Directory holding service and child logs.
pub const LOG_DIR_NAME: &str = "logs";

/// Directory holding timestamped deployment backups.
pub const BACKUP_DIR_NAME: &str = "backups";

/// Plain-text version marker written into the deployment directory.
pub const VERSION_MARKER_NAME: &str = "VERSION";

/// Machine-readable install manifest written into the install root.
pub const MANIFEST_FILE_NAME: &str = "install-info.json";

/// Marker file every runtime sandbox carries.
pub const RUNTIME_MARKER_FILE: &str = "pyvenv.cfg";

/// Package marker identifying an importable package directory.
pub const PACKAGE_MARKER_FILE: &str = "__init__.py";

/// Project metadata file used to locate the source root and its version.
pub const PROJECT_FILE_NAME: &str = "pyproject.toml";

/// Dependency list installed into the sandbox when present.
pub const REQUIREMENTS_FILE_NAME: &str = "requirements.txt";

/// Default entry point, relative to the source root.
pub const DEFAULT_ENTRY_POINT: &str = "main.py";

/// Supervisor stdout log file name.
pub const SERVICE_STDOUT_LOG: &str = "supervisor.log";

/// Supervisor stderr log file name.
pub const SERVICE_STDERR_LOG: &str = "supervisor-err.log";

// ============================================================================
// Runtime Requirements
// ============================================================================

/// Minimum supported interpreter version.
pub const MIN_RUNTIME_VERSION: semver::Version = semver::Version::new(3, 10, 0);

/// Fast provisioning tool preferred when present on PATH.
pub const FAST_PROVISIONER: &str = "uv";

// ============================================================================
// Supervisor Timing
// ============================================================================

/// Default interval between config polls.
pub const DEFAULT_CONFIG_POLL_SECONDS: u64 = 5;

/// Default interval between child liveness checks.
pub const DEFAULT_HEALTH_CHECK_SECONDS: u64 = 10;

/// Graceful stop timeout before the child is force-killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the stop issued while the supervisor itself shuts down.
pub const SHUTDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity of the supervisor's sleep so shutdown is noticed promptly.
pub const LOOP_SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Polling interval while waiting for a signalled child to exit.
pub const PROCESS_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Polling interval while following a log file.
pub const LOG_FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Managed Server Defaults
// ============================================================================

/// Default bind host passed to the managed server.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port passed to the managed server.
pub const DEFAULT_PORT: u16 = 8000;

/// Transport the managed server is started with.
pub const DEFAULT_TRANSPORT: &str = "sse";

/// Default size threshold for rotating the child log.
pub const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated child logs kept.
pub const DEFAULT_LOG_BACKUP_COUNT: usize = 5;

/// Default number of lines shown by `warden logs`.
pub const DEFAULT_LOG_LINES: usize = 50;

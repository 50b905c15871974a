//! Warden installs a Python server application as a per-user background service and keeps
//! it running. It provisions an isolated runtime sandbox, deploys a versioned snapshot of the
//! application, migrates prior configuration, registers the host's native service manager,
//! and runs a small resident supervisor that starts, stops and restarts the server whenever
//! the operator flips `daemon.enabled` in the live config.

/// Composition root of the resident supervisor.
pub mod bootstrap;

/// CLI interface.
pub mod cli;

/// Live configuration file handling.
pub mod config;

/// Names, environment variables and timing defaults.
pub mod constants;

/// Application snapshot deployment.
pub mod deploy;

/// Error handling.
pub mod error;

/// Install, uninstall, status and restore workflows.
pub mod installer;

/// Log rotation and tailing.
pub mod logs;

/// Prior config migration.
pub mod migrate;

/// Install layout.
pub mod paths;

/// Managed child process lifecycle.
pub mod process;

/// Runtime sandbox management.
pub mod runtime_env;

/// Native OS service registration.
pub mod service;

/// Config change detection.
pub mod watcher;

/// Version markers and the install manifest.
pub mod version;

#[doc(hidden)]
pub mod test_utils;

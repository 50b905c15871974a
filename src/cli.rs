//! Command-line interface for warden.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for warden.
#[derive(Parser)]
#[command(name = "warden", version, author)]
#[command(
    about = "Installs a Python server as a per-user background service and keeps it running",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for warden.
#[derive(Subcommand)]
pub enum Commands {
    /// Install or upgrade the server and register the background service.
    Install {
        /// Redeploy even if the installed version matches the source.
        #[arg(long)]
        force: bool,

        /// Delete and recreate the runtime sandbox.
        #[arg(long = "force-runtime")]
        force_runtime: bool,

        /// Never prompt; keep the current config when a prior install's config conflicts.
        #[arg(short, long)]
        yes: bool,

        /// Replace the live config with a prior install's config (after a backup).
        #[arg(long = "overwrite-config")]
        overwrite_config: bool,

        /// Skip backups. Steps that would overwrite a file are skipped instead.
        #[arg(long = "no-backup")]
        no_backup: bool,

        /// Install files only; do not register the OS service.
        #[arg(long = "no-service")]
        no_service: bool,
    },

    /// Unregister the background service and remove the wrappers.
    Uninstall {
        /// Also remove the runtime sandbox, the deployment and the manifest.
        #[arg(long)]
        purge: bool,
    },

    /// Show the installed version, service state and server process.
    Status {
        /// Emit machine-readable JSON output instead of a report.
        #[arg(long)]
        json: bool,
    },

    /// Show the background service's logs.
    Logs {
        /// Keep printing new lines as they are written.
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show (default: 50).
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Run the resident supervisor. This is what the OS service launches.
    Run {
        /// Path to the live config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Runtime sandbox executable that runs the server.
        #[arg(long)]
        runtime: Option<PathBuf>,

        /// Server entry point passed to the runtime.
        #[arg(long = "entry-point")]
        entry_point: Option<PathBuf>,

        /// Working directory for the server process.
        #[arg(long = "working-dir")]
        working_dir: Option<PathBuf>,
    },

    /// Restore a config or deployment backup made by an earlier install.
    Restore {
        /// Path to a `<file>.backup-*` config backup or a `deploy-*` backup directory.
        backup: PathBuf,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_flags_parse() {
        let cli = Cli::try_parse_from([
            "warden",
            "install",
            "--force",
            "--yes",
            "--no-service",
        ])
        .unwrap();
        match cli.command {
            Commands::Install {
                force,
                yes,
                no_service,
                no_backup,
                ..
            } => {
                assert!(force && yes && no_service);
                assert!(!no_backup);
            }
            _ => panic!("expected install command"),
        }
    }

    #[test]
    fn logs_defaults_to_fifty_lines() {
        let cli = Cli::try_parse_from(["warden", "logs", "-f"]).unwrap();
        match cli.command {
            Commands::Logs { follow, lines } => {
                assert!(follow);
                assert_eq!(lines, 50);
            }
            _ => panic!("expected logs command"),
        }
    }

    #[test]
    fn run_accepts_descriptor_arguments() {
        let cli = Cli::try_parse_from([
            "warden",
            "run",
            "--config",
            "/tmp/config.json",
            "--runtime",
            "/tmp/runtime/bin/python",
            "--entry-point",
            "/tmp/app/main.py",
            "--working-dir",
            "/tmp/app",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                config,
                entry_point,
                ..
            } => {
                assert_eq!(config, Some(PathBuf::from("/tmp/config.json")));
                assert_eq!(entry_point, Some(PathBuf::from("/tmp/app/main.py")));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn log_level_accepts_numbers_and_names() {
        let cli = Cli::try_parse_from(["warden", "--log-level", "4", "status"]).unwrap();
        assert_eq!(cli.log_level.map(|level| level.as_str()), Some("debug"));
        let cli = Cli::try_parse_from(["warden", "status", "--log-level", "warning"]).unwrap();
        assert_eq!(cli.log_level.map(|level| level.as_str()), Some("warn"));
        assert!(Cli::try_parse_from(["warden", "--log-level", "9", "status"]).is_err());
    }

    #[test]
    fn restore_requires_backup_path() {
        assert!(Cli::try_parse_from(["warden", "restore"]).is_err());
    }
}

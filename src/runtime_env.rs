//! Isolated runtime sandbox for the managed application.
//!
//! Every external tool is invoked with an explicit argument vector; nothing here goes
//! through a shell.
use regex::Regex;
use semver::Version;
use std::{
    env,
    ffi::{OsStr, OsString},
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
    sync::LazyLock,
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info};

use crate::{
    constants::{ENV_PYTHON, FAST_PROVISIONER, MIN_RUNTIME_VERSION, RUNTIME_MARKER_FILE},
    error::EnvironmentError,
};

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version pattern is valid")
});

/// Tool that created a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Provisioner {
    /// The fast external provisioner found on PATH.
    Uv,
    /// The interpreter's built-in `venv` module.
    Venv,
}

/// Outcome of [`RuntimeEnvironment::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A valid sandbox was already present and left alone.
    AlreadyExists,
    /// A new sandbox was created.
    Created { tool: Provisioner },
}

/// Manages one sandbox directory built from a host interpreter.
#[derive(Debug, Clone)]
pub struct RuntimeEnvironment {
    dir: PathBuf,
    interpreter: PathBuf,
    tool_search_path: Option<OsString>,
}

impl RuntimeEnvironment {
    pub fn new(dir: impl Into<PathBuf>, interpreter: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interpreter: interpreter.into(),
            tool_search_path: None,
        }
    }

    /// Uses `WARDEN_PYTHON` as the host interpreter, falling back to the platform default.
    pub fn from_env(dir: impl Into<PathBuf>) -> Self {
        let interpreter = env::var_os(ENV_PYTHON)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(if cfg!(windows) { "python" } else { "python3" })
            });
        Self::new(dir, interpreter)
    }

    /// Restricts where provisioning tools are looked up instead of the process `PATH`.
    pub fn with_tool_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.tool_search_path = Some(search_path.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    /// Checks the host interpreter against the supported floor and returns its version.
    pub fn validate_version(&self) -> Result<Version, EnvironmentError> {
        let found = interpreter_version(&self.interpreter)?;
        if found < MIN_RUNTIME_VERSION {
            return Err(EnvironmentError::IncompatibleVersion {
                found,
                required: MIN_RUNTIME_VERSION,
            });
        }

        debug!(
            "Interpreter {} reports version {found}",
            self.interpreter.display()
        );
        Ok(found)
    }

    /// Structural check: the marker file plus the platform's executable and activation
    /// script must all be present.
    pub fn detect(&self) -> bool {
        self.dir.join(RUNTIME_MARKER_FILE).is_file()
            && self.executable_path().is_file()
            && self.activation_script().is_file()
    }

    /// Creates the sandbox unless a valid one exists; `force` deletes and recreates it.
    pub fn create(&self, force: bool) -> Result<CreateOutcome, EnvironmentError> {
        if self.detect() && !force {
            info!("Runtime sandbox already present at {}", self.dir.display());
            return Ok(CreateOutcome::AlreadyExists);
        }

        if self.dir.exists() {
            info!("Removing existing runtime sandbox at {}", self.dir.display());
            fs::remove_dir_all(&self.dir)?;
        }
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent)?;
        }

        let (mut cmd, tool) = match self.find_tool(FAST_PROVISIONER) {
            Some(uv) => {
                let mut cmd = Command::new(uv);
                cmd.arg("venv")
                    .arg("--python")
                    .arg(&self.interpreter)
                    .arg(&self.dir);
                (cmd, Provisioner::Uv)
            }
            None => {
                let mut cmd = Command::new(&self.interpreter);
                cmd.args(["-m", "venv"]).arg(&self.dir);
                (cmd, Provisioner::Venv)
            }
        };

        info!(
            "Creating runtime sandbox at {} with {tool}",
            self.dir.display()
        );
        run_checked(&mut cmd)?;

        if !self.detect() {
            return Err(EnvironmentError::Corrupt {
                path: self.dir.clone(),
            });
        }

        Ok(CreateOutcome::Created { tool })
    }

    /// Path of the sandbox's own executable. Fails until the sandbox has been created.
    pub fn resolve_executable(&self) -> Result<PathBuf, EnvironmentError> {
        if !self.dir.exists() {
            return Err(EnvironmentError::Missing {
                path: self.dir.clone(),
            });
        }

        let executable = self.executable_path();
        if !executable.is_file() {
            return Err(EnvironmentError::Corrupt {
                path: self.dir.clone(),
            });
        }
        Ok(executable)
    }

    /// Installs a requirements file into the sandbox.
    pub fn install_dependencies(&self, requirements: &Path) -> Result<(), EnvironmentError> {
        let executable = self.resolve_executable()?;

        let mut cmd = match self.find_tool(FAST_PROVISIONER) {
            Some(uv) => {
                let mut cmd = Command::new(uv);
                cmd.args(["pip", "install", "--python"])
                    .arg(&executable)
                    .arg("-r")
                    .arg(requirements);
                cmd
            }
            None => {
                let mut cmd = Command::new(&executable);
                cmd.args(["-m", "pip", "install", "--disable-pip-version-check", "-r"])
                    .arg(requirements);
                cmd
            }
        };

        info!(
            "Installing dependencies from {} into the runtime sandbox",
            requirements.display()
        );
        run_checked(&mut cmd)?;
        Ok(())
    }

    /// Version reported by the sandbox's own executable.
    pub fn runtime_version(&self) -> Result<Version, EnvironmentError> {
        interpreter_version(&self.resolve_executable()?)
    }

    /// Where the sandbox executable lives once the sandbox exists.
    pub fn executable_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.dir.join("Scripts").join("python.exe")
        } else {
            self.dir.join("bin").join("python")
        }
    }

    fn activation_script(&self) -> PathBuf {
        if cfg!(windows) {
            self.dir.join("Scripts").join("activate.bat")
        } else {
            self.dir.join("bin").join("activate")
        }
    }

    fn find_tool(&self, program: &str) -> Option<PathBuf> {
        find_on_path(program, self.tool_search_path.as_deref())
    }
}

/// Looks `program` up on `search_path`, or on the process `PATH` when `None`.
pub fn find_on_path(program: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = match search_path {
        Some(path) => path.to_os_string(),
        None => env::var_os("PATH")?,
    };

    let file_name = if cfg!(windows) {
        format!("{program}.exe")
    } else {
        program.to_string()
    };

    env::split_paths(&path_var)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

fn interpreter_version(interpreter: &Path) -> Result<Version, EnvironmentError> {
    let output = Command::new(interpreter)
        .arg("--version")
        .output()
        .map_err(|source| EnvironmentError::InterpreterUnavailable {
            interpreter: interpreter.to_path_buf(),
            source,
        })?;

    // Older interpreters print the banner on stderr.
    let mut banner = String::from_utf8_lossy(&output.stdout).into_owned();
    banner.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_version(banner.trim())
}

fn parse_version(banner: &str) -> Result<Version, EnvironmentError> {
    let caps = VERSION_PATTERN
        .captures(banner)
        .ok_or_else(|| EnvironmentError::VersionUnreadable(banner.to_string()))?;

    let part = |idx: usize| -> Result<u64, EnvironmentError> {
        caps.get(idx)
            .map_or(Ok(0), |m| m.as_str().parse())
            .map_err(|_| EnvironmentError::VersionUnreadable(banner.to_string()))
    };

    Ok(Version::new(part(1)?, part(2)?, part(3)?))
}

fn run_checked(cmd: &mut Command) -> Result<Output, EnvironmentError> {
    let command = format!("{cmd:?}");
    debug!("Executing command: {command}");

    let output = cmd
        .output()
        .map_err(|source| EnvironmentError::InterpreterUnavailable {
            interpreter: PathBuf::from(cmd.get_program()),
            source,
        })?;

    if !output.status.success() {
        return Err(EnvironmentError::CommandFailed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

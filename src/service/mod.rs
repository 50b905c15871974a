//! Native OS service registration for the resident supervisor.
//!
//! One [`ServiceRegistrar`] implementation per service manager, chosen once by
//! [`registrar_for_host`]. All external tools run through a [`CommandRunner`] so the
//! command sequences can be exercised without the tools installed.
use std::{
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Arc, atomic::AtomicBool},
};

use tracing::debug;

use crate::{
    constants::{APP_NAME, DEFAULT_LOG_LINES},
    error::ServiceRegistrationError,
    logs,
    paths::InstallPaths,
    runtime_env::find_on_path,
};

pub mod launchd;
pub mod systemd;
pub mod windows;

pub use launchd::LaunchdRegistrar;
pub use systemd::SystemdRegistrar;
pub use windows::WindowsRegistrar;

/// What the service manager launches and where it sends output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdout_log_path: PathBuf,
    pub stderr_log_path: PathBuf,
    pub auto_start: bool,
}

impl ServiceDescriptor {
    /// Descriptor that runs the supervisor snapshot against the sandboxed runtime.
    ///
    /// `runtime_executable` must be the sandbox's own executable, never a system one.
    pub fn for_install(
        paths: &InstallPaths,
        runtime_executable: &Path,
        entry_point: &Path,
    ) -> Self {
        let args = vec![
            "run".to_string(),
            "--config".to_string(),
            paths.config_file.display().to_string(),
            "--runtime".to_string(),
            runtime_executable.display().to_string(),
            "--entry-point".to_string(),
            entry_point.display().to_string(),
            "--working-dir".to_string(),
            paths.deploy_dir.display().to_string(),
        ];

        Self {
            name: APP_NAME.to_string(),
            executable_path: supervisor_binary(paths),
            args,
            working_dir: paths.deploy_dir.clone(),
            stdout_log_path: paths.service_stdout_log(),
            stderr_log_path: paths.service_stderr_log(),
            auto_start: true,
        }
    }

    /// Executable followed by its arguments.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.executable_path.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Location of the supervisor binary snapshot the service descriptor points to.
pub fn supervisor_binary(paths: &InstallPaths) -> PathBuf {
    let name = if cfg!(windows) {
        format!("{APP_NAME}.exe")
    } else {
        APP_NAME.to_string()
    };
    paths.bin_dir.join(name)
}

/// Register/unregister/query the supervisor with the host's service manager.
pub trait ServiceRegistrar {
    /// Short name of the service manager, for reporting.
    fn platform(&self) -> &'static str;

    fn descriptor(&self) -> &ServiceDescriptor;

    /// Writes the service definition, enables auto-start, and starts the service.
    fn install(&self) -> Result<(), ServiceRegistrationError>;

    /// Stops the service and removes its definition. Succeeds when nothing is installed.
    fn uninstall(&self) -> Result<(), ServiceRegistrationError>;

    fn is_installed(&self) -> bool;

    fn is_running(&self) -> bool;

    /// Prints recent service output, optionally following it.
    fn show_logs(&self, follow: bool, lines: usize) -> Result<(), ServiceRegistrationError>;
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined, trimmed.
    pub fn combined(&self) -> String {
        format!("{} {}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }
}

/// Runs external tools with explicit argument vectors, never through a shell.
pub trait CommandRunner: Send + Sync {
    /// Runs to completion, capturing output.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Runs with the terminal attached, for streaming output to the operator.
    fn stream(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    fn is_available(&self, program: &str) -> bool;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        debug!("Executing command: {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn stream(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let status = Command::new(program).args(args).status()?;
        Ok(CommandOutput {
            success: status.success(),
            status: status.to_string(),
            ..CommandOutput::default()
        })
    }

    fn is_available(&self, program: &str) -> bool {
        find_on_path(program, None).is_some()
    }
}

/// Picks the registrar for the host OS.
pub fn registrar_for_host(
    descriptor: ServiceDescriptor,
    home: &Path,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn ServiceRegistrar> {
    if cfg!(target_os = "windows") {
        Box::new(WindowsRegistrar::new(descriptor, runner))
    } else if cfg!(target_os = "macos") {
        Box::new(LaunchdRegistrar::new(descriptor, home, runner))
    } else {
        Box::new(SystemdRegistrar::for_user(descriptor, home, runner))
    }
}

/// Runs a command and turns a non-zero exit into [`ServiceRegistrationError::CommandFailed`].
pub(crate) fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<CommandOutput, ServiceRegistrationError> {
    let output = runner.run(program, args)?;
    if output.success {
        return Ok(output);
    }

    Err(ServiceRegistrationError::CommandFailed {
        command: format!("{program} {}", args.join(" ")),
        status: output.status.clone(),
        output: output.combined(),
    })
}

/// Runs a command whose failure is expected in some states (e.g. stopping a stopped unit).
pub(crate) fn run_lenient(runner: &dyn CommandRunner, program: &str, args: &[String]) {
    match runner.run(program, args) {
        Ok(output) if !output.success => debug!(
            "'{program} {}' exited with {}: {}",
            args.join(" "),
            output.status,
            output.combined()
        ),
        Ok(_) => {}
        Err(err) => debug!("'{program}' could not be run: {err}"),
    }
}

/// Prints the descriptor's raw stdout/stderr files.
pub(crate) fn show_raw_logs(
    descriptor: &ServiceDescriptor,
    follow: bool,
    lines: usize,
) -> Result<(), ServiceRegistrationError> {
    let lines = if lines == 0 { DEFAULT_LOG_LINES } else { lines };
    let files = [
        descriptor.stdout_log_path.clone(),
        descriptor.stderr_log_path.clone(),
    ];
    logs::show_files(&files, lines, follow, Arc::new(AtomicBool::new(false)))?;
    Ok(())
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

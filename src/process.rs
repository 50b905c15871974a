//! Lifecycle of the single managed server process.
use chrono::{DateTime, Utc};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::{DaemonConfig, LogRotation},
    constants::{DEFAULT_TRANSPORT, PROCESS_EXIT_POLL_INTERVAL},
    error::{ConfigError, ProcessError},
    logs::rotate_if_needed,
};

/// Supervisor-level state of the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Stopping,
}

/// The parts of a launch that are fixed for the life of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    /// Executable inside the runtime sandbox.
    pub executable: PathBuf,
    /// Application entry point passed as the first argument.
    pub entry_point: PathBuf,
    /// Working directory of the managed process.
    pub working_dir: PathBuf,
}

/// A fully resolved launch: target plus the settings derived from the live config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub entry_point: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_rotation: LogRotation,
    pub pid_file: Option<PathBuf>,
}

impl LaunchSpec {
    /// Combines the fixed target with the transport flags and files from `config`.
    pub fn from_config(
        target: &LaunchTarget,
        config: &DaemonConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            executable: target.executable.clone(),
            entry_point: target.entry_point.clone(),
            args: transport_args(config),
            working_dir: target.working_dir.clone(),
            log_file: config.resolved_log_file()?,
            log_rotation: config.log_rotation,
            pid_file: config.resolved_pid_file()?,
        })
    }
}

/// Flags telling the managed server how to listen.
pub fn transport_args(config: &DaemonConfig) -> Vec<String> {
    vec![
        "--transport".to_string(),
        DEFAULT_TRANSPORT.to_string(),
        "--host".to_string(),
        config.host.clone(),
        "--port".to_string(),
        config.port.to_string(),
    ]
}

/// A process spawned by [`ProcessSupervisor`]. Never built from a pid found elsewhere.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    start_time: DateTime<Utc>,
    last_observed_alive: bool,
    child: Child,
    pid_file: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Result of the most recent liveness poll.
    pub fn last_observed_alive(&self) -> bool {
        self.last_observed_alive
    }
}

/// Owns at most one managed child process at a time.
#[derive(Debug)]
pub struct ProcessSupervisor {
    state: SupervisorState,
    handle: Option<ProcessHandle>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Stopped,
            handle: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }

    /// Spawns the managed process unless one is already alive.
    ///
    /// Fails with [`ProcessError::ExecutableMissing`] when the runtime executable is
    /// absent. Failures are not retried here; the caller decides when to try again.
    pub fn start(&mut self, spec: &LaunchSpec) -> Result<&ProcessHandle, ProcessError> {
        if self.is_alive() {
            debug!("Managed process already running; start is a no-op");
        } else {
            self.state = SupervisorState::Starting;
            match spawn_child(spec) {
                Ok(handle) => {
                    info!(
                        "Started managed process (PID {}) from {}",
                        handle.pid,
                        spec.executable.display()
                    );
                    self.handle = Some(handle);
                    self.state = SupervisorState::Running;
                }
                Err(err) => {
                    self.state = SupervisorState::Stopped;
                    return Err(err);
                }
            }
        }

        self.handle.as_ref().ok_or_else(|| ProcessError::SpawnError {
            executable: spec.executable.clone(),
            source: io::Error::other("managed process exited during start"),
        })
    }

    /// Non-blocking liveness check.
    ///
    /// When the process has exited the handle is destroyed and the state becomes
    /// [`SupervisorState::Crashed`].
    pub fn is_alive(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };

        match handle.child.try_wait() {
            Ok(None) => {
                handle.last_observed_alive = true;
                true
            }
            Ok(Some(status)) => {
                let pid = handle.pid;
                handle.last_observed_alive = false;
                warn!("Managed process (PID {pid}) exited unexpectedly: {status}");
                self.release_handle();
                self.state = SupervisorState::Crashed;
                false
            }
            Err(err) => {
                error!(
                    "Failed to poll managed process (PID {}): {err}",
                    handle.pid
                );
                handle.last_observed_alive
            }
        }
    }

    /// Requests a graceful exit and force-kills after `timeout`.
    ///
    /// The handle is cleared on return regardless of the outcome.
    pub fn stop(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ProcessError> {
        let Some(mut handle) = self.release_handle() else {
            self.state = SupervisorState::Stopped;
            return Ok(None);
        };

        self.state = SupervisorState::Stopping;
        info!("Stopping managed process (PID {})", handle.pid);
        let result = terminate(&mut handle.child, handle.pid, timeout);
        self.state = SupervisorState::Stopped;

        if let Ok(Some(status)) = &result {
            debug!("Managed process (PID {}) exited with {status}", handle.pid);
        }
        result
    }

    fn release_handle(&mut self) -> Option<ProcessHandle> {
        let handle = self.handle.take()?;
        if let Some(pid_file) = &handle.pid_file
            && let Err(err) = fs::remove_file(pid_file)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove pid file {}: {err}", pid_file.display());
        }
        Some(handle)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.handle.is_some()
            && let Err(err) = self.stop(Duration::from_secs(2))
        {
            warn!("Failed to stop managed process while dropping supervisor: {err}");
        }
    }
}

/// Launches the child with its own process group and optional log redirection.
fn spawn_child(spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError> {
    if !spec.executable.is_file() {
        return Err(ProcessError::ExecutableMissing {
            path: spec.executable.clone(),
        });
    }

    let mut cmd = Command::new(&spec.executable);
    cmd.arg(&spec.entry_point)
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null());

    match &spec.log_file {
        Some(log_file) => {
            let log = open_child_log(log_file, spec.log_rotation)?;
            cmd.stdout(Stdio::from(log.try_clone()?))
                .stderr(Stdio::from(log));
        }
        None => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // Own process group, so a stop reaches anything the server forks.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    debug!("Executing command: {cmd:?}");
    let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnError {
        executable: spec.executable.clone(),
        source,
    })?;
    let pid = child.id();

    if let Some(pid_file) = &spec.pid_file
        && let Err(err) = write_pid_file(pid_file, pid)
    {
        // An untracked child would be duplicated by the next health check.
        warn!(
            "Cannot write pid file {}; stopping managed process (PID {pid})",
            pid_file.display()
        );
        if let Err(kill_err) = force_kill(&mut child, pid) {
            warn!("Failed to kill managed process (PID {pid}): {kill_err}");
        }
        if let Err(wait_err) = child.wait() {
            warn!("Failed to reap managed process (PID {pid}): {wait_err}");
        }
        return Err(err);
    }

    Ok(ProcessHandle {
        pid,
        start_time: Utc::now(),
        last_observed_alive: true,
        child,
        pid_file: spec.pid_file.clone(),
    })
}

fn open_child_log(path: &Path, rotation: LogRotation) -> Result<fs::File, ProcessError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(err) = rotate_if_needed(path, rotation.max_bytes, rotation.backup_count) {
        warn!("Log rotation for {} failed: {err}", path.display());
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn write_pid_file(path: &Path, pid: u32) -> Result<(), ProcessError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))?;
    Ok(())
}

/// Waits for a child with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(PROCESS_EXIT_POLL_INTERVAL);
            }
        }
    }
}

fn terminate(
    child: &mut Child,
    pid: u32,
    timeout: Duration,
) -> Result<Option<ExitStatus>, ProcessError> {
    let stop_err = |source| ProcessError::StopError { pid, source };

    if let Some(status) = child.try_wait().map_err(stop_err)? {
        debug!("Managed process (PID {pid}) had already exited");
        return Ok(Some(status));
    }

    request_graceful_stop(child, pid)?;

    if let Some(status) = wait_with_timeout(child, timeout).map_err(stop_err)? {
        return Ok(Some(status));
    }

    warn!("Managed process (PID {pid}) did not exit within {timeout:?}; killing it");
    force_kill(child, pid)?;
    child.wait().map(Some).map_err(stop_err)
}

#[cfg(unix)]
fn request_graceful_stop(_child: &mut Child, pid: u32) -> Result<(), ProcessError> {
    use nix::{
        errno::Errno,
        sys::signal::{self, Signal},
        unistd::{Pid, getpgid},
    };

    let target = Pid::from_raw(pid as i32);
    let nix_err = |err: Errno| ProcessError::StopError {
        pid,
        source: io::Error::from_raw_os_error(err as i32),
    };

    if getpgid(Some(target)) == Ok(target) {
        match signal::killpg(target, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                warn!(
                    "Insufficient permissions to signal process group {pid}; falling back to direct signal"
                );
            }
            Err(err) => return Err(nix_err(err)),
        }
    }

    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(nix_err(err)),
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child, pid: u32) -> Result<(), ProcessError> {
    // No termination signal to send; the platform only offers a hard stop.
    child
        .kill()
        .or_else(|err| match err.kind() {
            io::ErrorKind::InvalidInput => Ok(()),
            _ => Err(err),
        })
        .map_err(|source| ProcessError::StopError { pid, source })
}

fn force_kill(child: &mut Child, pid: u32) -> Result<(), ProcessError> {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{self, Signal},
            unistd::Pid,
        };
        let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }

    match child.kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(source) => Err(ProcessError::StopError { pid, source }),
    }
}

//! Resident supervisory loop: config polling plus health checks over one managed process.
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{DaemonConfig, load_daemon_config},
    constants::{LOOP_SLEEP_SLICE, SHUTDOWN_STOP_TIMEOUT, STOP_TIMEOUT},
    error::ProcessError,
    process::{LaunchSpec, LaunchTarget, ProcessSupervisor, SupervisorState},
    watcher::ConfigWatcher,
};

/// Drives a [`ProcessSupervisor`] from the live config file.
///
/// Single-threaded: [`BootstrapService::run`] sleeps in short slices between the poll and
/// health deadlines and only ever returns after a shutdown request.
pub struct BootstrapService {
    config_path: PathBuf,
    target: LaunchTarget,
    watcher: ConfigWatcher,
    supervisor: ProcessSupervisor,
    running: Arc<AtomicBool>,
    config: Option<DaemonConfig>,
    poll_interval: Duration,
    health_interval: Duration,
    next_poll: Instant,
    next_health: Instant,
    first_iteration: bool,
    consecutive_crashes: u32,
}

impl BootstrapService {
    pub fn new(config_path: impl Into<PathBuf>, target: LaunchTarget) -> Self {
        let config_path = config_path.into();
        let defaults = DaemonConfig::default();
        let now = Instant::now();

        Self {
            watcher: ConfigWatcher::new(&config_path),
            config_path,
            target,
            supervisor: ProcessSupervisor::new(),
            running: Arc::new(AtomicBool::new(true)),
            config: None,
            poll_interval: defaults.poll_interval(),
            health_interval: defaults.health_interval(),
            next_poll: now,
            next_health: now,
            first_iteration: true,
            consecutive_crashes: 0,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// The supervised process, for inspection.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Crash restarts since the managed process last survived a health interval.
    pub fn consecutive_crashes(&self) -> u32 {
        self.consecutive_crashes
    }

    /// Flag that keeps the loop alive; store `false` to request shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Routes SIGINT and SIGTERM (Ctrl-C on Windows) to the shutdown flag.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let running = self.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            running.store(false, Ordering::SeqCst);
        })
    }

    /// Runs until the shutdown flag is cleared, then stops the managed process.
    pub fn run(&mut self) {
        info!(
            "Supervisor started; watching {}",
            self.config_path.display()
        );

        while self.running.load(Ordering::SeqCst) {
            self.tick();
            self.sleep_until_next_deadline();
        }

        info!("Supervisor shutting down");
        if let Err(err) = self.supervisor.stop(SHUTDOWN_STOP_TIMEOUT) {
            error!("Failed to stop managed process during shutdown: {err}");
        }
    }

    /// One loop iteration: a config poll and a health check when their deadlines are due.
    ///
    /// Errors are logged and never escape; the next deadline is scheduled regardless.
    pub fn tick(&mut self) {
        if self.first_iteration || Instant::now() >= self.next_poll {
            if let Err(err) = self.poll_config() {
                error!("Config poll failed: {err}");
            }
            self.next_poll = Instant::now() + self.poll_interval;
        }

        if Instant::now() >= self.next_health {
            if let Err(err) = self.check_health() {
                error!("Health check failed: {err}");
            }
            self.next_health = Instant::now() + self.health_interval;
        }
    }

    fn poll_config(&mut self) -> Result<(), ProcessError> {
        let changed = self.watcher.poll_changed();
        let first = std::mem::take(&mut self.first_iteration);

        if !changed {
            if first {
                warn!(
                    "No usable config at {}; managed server stays stopped",
                    self.config_path.display()
                );
            }
            return Ok(());
        }

        let config = load_daemon_config(&self.config_path)?;
        self.apply_config(config)
    }

    fn apply_config(&mut self, config: DaemonConfig) -> Result<(), ProcessError> {
        self.poll_interval = config.poll_interval();
        self.health_interval = config.health_interval();
        self.next_health = self.next_health.min(Instant::now() + self.health_interval);

        let previous = self.config.replace(config.clone());
        let was_enabled = previous.as_ref().is_some_and(|prev| prev.enabled);

        match (was_enabled, config.enabled) {
            (false, true) => {
                info!("Daemon enabled; starting managed server");
                self.consecutive_crashes = 0;
                self.start_child(&config)
            }
            (true, false) => {
                info!("Daemon disabled; stopping managed server");
                self.consecutive_crashes = 0;
                self.supervisor.stop(STOP_TIMEOUT)?;
                Ok(())
            }
            (true, true) => {
                if previous.is_some_and(|prev| prev.launch_settings_differ(&config)) {
                    info!(
                        "Launch settings changed; restarting managed server on {}:{}",
                        config.host, config.port
                    );
                    self.supervisor.stop(STOP_TIMEOUT)?;
                    self.start_child(&config)
                } else {
                    debug!("Config changed without affecting the managed server");
                    Ok(())
                }
            }
            (false, false) => {
                debug!("Daemon remains disabled");
                Ok(())
            }
        }
    }

    fn check_health(&mut self) -> Result<(), ProcessError> {
        let Some(config) = self.config.clone().filter(|config| config.enabled) else {
            return Ok(());
        };

        if self.supervisor.is_alive() {
            if self.consecutive_crashes > 0 {
                debug!(
                    "Managed server stable after {} crash restart(s)",
                    self.consecutive_crashes
                );
            }
            self.consecutive_crashes = 0;
            return Ok(());
        }

        if self.supervisor.state() == SupervisorState::Crashed {
            self.consecutive_crashes += 1;
            warn!(
                "Managed server crashed; restarting (consecutive crashes: {})",
                self.consecutive_crashes
            );
        } else {
            info!("Managed server is not running; starting it");
        }

        self.start_child(&config)
    }

    fn start_child(&mut self, config: &DaemonConfig) -> Result<(), ProcessError> {
        let spec = LaunchSpec::from_config(&self.target, config)?;
        let handle = self.supervisor.start(&spec)?;
        debug!(
            "Managed server running as PID {} since {}",
            handle.pid(),
            handle.start_time()
        );
        Ok(())
    }

    fn sleep_until_next_deadline(&self) {
        let deadline = self.next_poll.min(self.next_health);
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(LOOP_SLEEP_SLICE.min(deadline - now));
        }
    }
}

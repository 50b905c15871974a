//! Linux user service managed through `systemctl --user`.
use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use super::{
    CommandRunner, ServiceDescriptor, ServiceRegistrar, args, run_checked, run_lenient,
    show_raw_logs,
};
use crate::{constants::SYSTEMD_UNIT_NAME, error::ServiceRegistrationError};

const SYSTEMCTL: &str = "systemctl";
const JOURNALCTL: &str = "journalctl";

pub struct SystemdRegistrar {
    descriptor: ServiceDescriptor,
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SystemdRegistrar {
    /// Registrar whose units live under `home/.config/systemd/user`.
    pub fn new(descriptor: ServiceDescriptor, home: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            descriptor,
            unit_dir: user_unit_dir(home, None),
            runner,
        }
    }

    /// Registrar for the current user, honouring `XDG_CONFIG_HOME` the way systemd does.
    pub fn for_user(
        descriptor: ServiceDescriptor,
        home: &Path,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            descriptor,
            unit_dir: user_unit_dir(home, env::var_os("XDG_CONFIG_HOME")),
            runner,
        }
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(SYSTEMD_UNIT_NAME)
    }

    fn systemctl(&self, verb: &str) -> Vec<String> {
        args(["--user", verb, SYSTEMD_UNIT_NAME])
    }
}

/// Directory systemd searches for user units. Relative `XDG_CONFIG_HOME` values are
/// ignored, as the XDG base directory rules require.
pub fn user_unit_dir(home: &Path, config_home: Option<OsString>) -> PathBuf {
    config_home
        .map(PathBuf::from)
        .filter(|base| base.is_absolute())
        .unwrap_or_else(|| home.join(".config"))
        .join("systemd/user")
}

/// Renders the unit file for `descriptor`.
pub fn render_unit(descriptor: &ServiceDescriptor) -> String {
    let exec_start = descriptor
        .command_line()
        .iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "[Unit]\n\
         Description={name} supervisor\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec_start}\n\
         WorkingDirectory={working_dir}\n\
         Restart=always\n\
         RestartSec=5\n\
         StandardOutput=append:{stdout}\n\
         StandardError=append:{stderr}\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        name = descriptor.name,
        working_dir = descriptor.working_dir.display(),
        stdout = descriptor.stdout_log_path.display(),
        stderr = descriptor.stderr_log_path.display(),
    )
}

/// Quotes one `ExecStart=` word; `%` is the specifier escape.
fn quote_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%");
    if escaped.is_empty() || escaped.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", escaped.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        escaped
    }
}

impl ServiceRegistrar for SystemdRegistrar {
    fn platform(&self) -> &'static str {
        "systemd"
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn install(&self) -> Result<(), ServiceRegistrationError> {
        if !self.runner.is_available(SYSTEMCTL) {
            return Err(ServiceRegistrationError::ToolMissing {
                tool: SYSTEMCTL.to_string(),
                remediation: "User services need systemd. Start `warden run` from your session \
                              startup instead, or install on a systemd-based distribution."
                    .to_string(),
            });
        }

        let unit_path = self.unit_path();
        let write_err = |source| ServiceRegistrationError::Write {
            path: unit_path.clone(),
            source,
        };
        fs::create_dir_all(&self.unit_dir).map_err(write_err)?;
        if let Some(log_dir) = self.descriptor.stdout_log_path.parent() {
            fs::create_dir_all(log_dir)?;
        }
        fs::write(&unit_path, render_unit(&self.descriptor)).map_err(write_err)?;
        info!("Wrote user unit {}", unit_path.display());

        let runner = self.runner.as_ref();
        run_checked(runner, SYSTEMCTL, &args(["--user", "daemon-reload"]))?;
        if self.descriptor.auto_start {
            run_checked(runner, SYSTEMCTL, &self.systemctl("enable"))?;
        }
        run_checked(runner, SYSTEMCTL, &self.systemctl("restart"))?;

        info!("Registered and started {SYSTEMD_UNIT_NAME}");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceRegistrationError> {
        let unit_path = self.unit_path();
        let tool_available = self.runner.is_available(SYSTEMCTL);

        if tool_available {
            let runner = self.runner.as_ref();
            run_lenient(runner, SYSTEMCTL, &self.systemctl("stop"));
            run_lenient(runner, SYSTEMCTL, &self.systemctl("disable"));
        } else {
            warn!("{SYSTEMCTL} not found; removing the unit file only");
        }

        if unit_path.exists() {
            fs::remove_file(&unit_path).map_err(|source| ServiceRegistrationError::Write {
                path: unit_path.clone(),
                source,
            })?;
            info!("Removed {}", unit_path.display());
        }

        if tool_available {
            run_lenient(
                self.runner.as_ref(),
                SYSTEMCTL,
                &args(["--user", "daemon-reload"]),
            );
        }
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.unit_path().is_file()
    }

    fn is_running(&self) -> bool {
        self.runner.is_available(SYSTEMCTL)
            && self
                .runner
                .run(SYSTEMCTL, &args(["--user", "is-active", "--quiet", SYSTEMD_UNIT_NAME]))
                .is_ok_and(|output| output.success)
    }

    /// Unit lifecycle records from the journal, then the redirected output files.
    fn show_logs(&self, follow: bool, lines: usize) -> Result<(), ServiceRegistrationError> {
        if self.runner.is_available(JOURNALCTL) {
            let journal_args = args([
                "--user".to_string(),
                "-u".to_string(),
                SYSTEMD_UNIT_NAME.to_string(),
                "-n".to_string(),
                lines.to_string(),
                "--no-pager".to_string(),
            ]);
            let output = self.runner.stream(JOURNALCTL, &journal_args)?;
            if !output.success {
                warn!("{JOURNALCTL} exited with {}", output.status);
            }
        }
        show_raw_logs(&self.descriptor, follow, lines)
    }
}

//! Windows service registered through the NSSM service wrapper.
//!
//! NSSM is never installed automatically; that needs administrator rights the installer
//! does not ask for.
use std::sync::Arc;

use tracing::info;

use super::{
    CommandRunner, ServiceDescriptor, ServiceRegistrar, args, run_checked, run_lenient,
    show_raw_logs,
};
use crate::{
    constants::{DEFAULT_LOG_MAX_BYTES, WINDOWS_SERVICE_NAME},
    error::ServiceRegistrationError,
};

const NSSM: &str = "nssm";

pub struct WindowsRegistrar {
    descriptor: ServiceDescriptor,
    runner: Arc<dyn CommandRunner>,
}

impl WindowsRegistrar {
    pub fn new(descriptor: ServiceDescriptor, runner: Arc<dyn CommandRunner>) -> Self {
        Self { descriptor, runner }
    }

    fn nssm(&self, verb: &str) -> Vec<String> {
        args([verb, WINDOWS_SERVICE_NAME])
    }

    fn set(&self, parameter: &str, value: impl Into<String>) -> Vec<String> {
        args([
            "set".to_string(),
            WINDOWS_SERVICE_NAME.to_string(),
            parameter.to_string(),
            value.into(),
        ])
    }

    fn status(&self) -> Option<String> {
        self.runner
            .run(NSSM, &self.nssm("status"))
            .ok()
            .filter(|output| output.success)
            .map(|output| output.stdout)
    }
}

/// The NSSM invocations that register and configure `descriptor`, in order.
pub fn registration_commands(registrar: &WindowsRegistrar) -> Vec<Vec<String>> {
    let descriptor = &registrar.descriptor;
    let mut install = args(["install", WINDOWS_SERVICE_NAME]);
    install.extend(descriptor.command_line());

    let start_mode = if descriptor.auto_start {
        "SERVICE_AUTO_START"
    } else {
        "SERVICE_DEMAND_START"
    };

    vec![
        install,
        registrar.set("AppDirectory", descriptor.working_dir.display().to_string()),
        registrar.set("DisplayName", format!("{} supervisor", descriptor.name)),
        registrar.set("AppStdout", descriptor.stdout_log_path.display().to_string()),
        registrar.set("AppStderr", descriptor.stderr_log_path.display().to_string()),
        registrar.set("AppRotateFiles", "1"),
        registrar.set("AppRotateOnline", "1"),
        registrar.set("AppRotateBytes", DEFAULT_LOG_MAX_BYTES.to_string()),
        registrar.set("AppExit", "Default Restart"),
        registrar.set("Start", start_mode),
    ]
}

impl ServiceRegistrar for WindowsRegistrar {
    fn platform(&self) -> &'static str {
        "nssm"
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn install(&self) -> Result<(), ServiceRegistrationError> {
        if !self.runner.is_available(NSSM) {
            return Err(ServiceRegistrationError::ToolMissing {
                tool: NSSM.to_string(),
                remediation: "Download NSSM from https://nssm.cc/download, put nssm.exe on PATH \
                              from an elevated prompt, then re-run `warden install`."
                    .to_string(),
            });
        }

        let runner = self.runner.as_ref();
        if self.is_installed() {
            info!("Replacing existing {WINDOWS_SERVICE_NAME} service");
            run_lenient(runner, NSSM, &self.nssm("stop"));
            run_lenient(runner, NSSM, &args(["remove", WINDOWS_SERVICE_NAME, "confirm"]));
        }

        if let Some(log_dir) = self.descriptor.stdout_log_path.parent() {
            std::fs::create_dir_all(log_dir)?;
        }
        for command in registration_commands(self) {
            run_checked(runner, NSSM, &command)?;
        }
        run_checked(runner, NSSM, &self.nssm("start"))?;

        info!("Registered and started the {WINDOWS_SERVICE_NAME} service");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceRegistrationError> {
        if !self.runner.is_available(NSSM) || !self.is_installed() {
            return Ok(());
        }

        let runner = self.runner.as_ref();
        run_lenient(runner, NSSM, &self.nssm("stop"));
        run_checked(runner, NSSM, &args(["remove", WINDOWS_SERVICE_NAME, "confirm"]))?;
        info!("Removed the {WINDOWS_SERVICE_NAME} service");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.runner.is_available(NSSM) && self.status().is_some()
    }

    fn is_running(&self) -> bool {
        self.runner.is_available(NSSM)
            && self
                .status()
                .is_some_and(|status| status.contains("SERVICE_RUNNING"))
    }

    fn show_logs(&self, follow: bool, lines: usize) -> Result<(), ServiceRegistrationError> {
        show_raw_logs(&self.descriptor, follow, lines)
    }
}

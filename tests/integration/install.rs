#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use common::{fake_tools, write_app_source};
use serde_json::json;
use tempfile::tempdir;
use warden::{
    config::{explicit_enabled, read_config_value, write_config_value},
    deploy::{AppSource, DeployOutcome},
    error::{InstallError, ServiceRegistrationError},
    installer::{
        BackupKind, ConfigAction, InstallOptions, InstallOrchestrator, RegistrarFactory,
    },
    migrate::MigrationAction,
    paths::InstallPaths,
    runtime_env::RuntimeEnvironment,
    service::{ServiceDescriptor, ServiceRegistrar},
};

#[derive(Default)]
struct Registry {
    installed: Option<ServiceDescriptor>,
    fail_with_missing_tool: bool,
}

/// In-memory service manager shared between the test and the orchestrator.
struct MemoryRegistrar {
    descriptor: ServiceDescriptor,
    registry: Arc<Mutex<Registry>>,
}

impl ServiceRegistrar for MemoryRegistrar {
    fn platform(&self) -> &'static str {
        "memory"
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn install(&self) -> Result<(), ServiceRegistrationError> {
        let mut registry = self.registry.lock().unwrap();
        if registry.fail_with_missing_tool {
            return Err(ServiceRegistrationError::ToolMissing {
                tool: "svc".to_string(),
                remediation: "install svc".to_string(),
            });
        }
        registry.installed = Some(self.descriptor.clone());
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceRegistrationError> {
        self.registry.lock().unwrap().installed = None;
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.registry.lock().unwrap().installed.is_some()
    }

    fn is_running(&self) -> bool {
        self.is_installed()
    }

    fn show_logs(&self, _follow: bool, _lines: usize) -> Result<(), ServiceRegistrationError> {
        Ok(())
    }
}

struct Sandbox {
    _temp: tempfile::TempDir,
    paths: InstallPaths,
    source_root: std::path::PathBuf,
    interpreter: std::path::PathBuf,
    registry: Arc<Mutex<Registry>>,
}

impl Sandbox {
    fn new(version: &str) -> Self {
        let temp = tempdir().expect("failed to create tempdir");
        let home = temp.path().join("home");
        fs::create_dir_all(&home).expect("failed to create home");
        let source_root = temp.path().join("checkout");
        write_app_source(&source_root, version);
        let (_, interpreter) = fake_tools(temp.path(), "3.12.1");

        Self {
            paths: InstallPaths::from_home(&home),
            source_root,
            interpreter,
            registry: Arc::new(Mutex::new(Registry::default())),
            _temp: temp,
        }
    }

    fn orchestrator(&self) -> InstallOrchestrator {
        let tools = self.interpreter.parent().expect("tools dir");
        let runtime = RuntimeEnvironment::new(&self.paths.runtime_dir, &self.interpreter)
            .with_tool_search_path(tools.as_os_str());
        let registry = Arc::clone(&self.registry);
        let factory: RegistrarFactory = Box::new(move |descriptor| {
            Box::new(MemoryRegistrar {
                descriptor,
                registry: Arc::clone(&registry),
            })
        });

        InstallOrchestrator::new(self.paths.clone(), runtime, factory)
            .with_source(AppSource::at(&self.source_root).expect("failed to read source"))
            .with_supervisor_source(&self.interpreter)
    }
}

fn quiet() -> InstallOptions {
    InstallOptions {
        interactive: false,
        ..InstallOptions::default()
    }
}

#[test]
fn service_descriptor_points_at_sandbox_not_host_interpreter() {
    let sandbox = Sandbox::new("1.0.0");
    sandbox.orchestrator().install(quiet()).expect("install");

    let registry = sandbox.registry.lock().unwrap();
    let descriptor = registry.installed.as_ref().expect("service registered");
    let runtime_arg = descriptor
        .args
        .iter()
        .skip_while(|arg| arg.as_str() != "--runtime")
        .nth(1)
        .expect("runtime argument");
    assert!(Path::new(runtime_arg).starts_with(&sandbox.paths.runtime_dir));
    assert_ne!(Path::new(runtime_arg), sandbox.interpreter.as_path());
    assert!(descriptor.executable_path.starts_with(&sandbox.paths.bin_dir));
    assert_eq!(descriptor.working_dir, sandbox.paths.deploy_dir);
}

#[test]
fn prior_install_config_is_migrated_on_first_install() {
    let sandbox = Sandbox::new("1.0.0");
    let legacy = sandbox.paths.legacy_config_candidates()[0].clone();
    fs::create_dir_all(legacy.parent().expect("parent")).expect("mkdir");
    fs::write(
        &legacy,
        r#"{"api_key": "abc", "daemon": {"enabled": false, "port": 9001}}"#,
    )
    .expect("write legacy config");

    let report = sandbox.orchestrator().install(quiet()).expect("install");
    assert_eq!(report.migration.action, MigrationAction::Copied);
    assert_eq!(report.config, ConfigAction::Unchanged);

    let config = read_config_value(&sandbox.paths.config_file).expect("config");
    assert_eq!(config["api_key"], json!("abc"));
    assert_eq!(explicit_enabled(&config), Some(false));
    assert!(legacy.is_file());
}

#[test]
fn conflicting_configs_are_kept_without_prompt_or_force() {
    let sandbox = Sandbox::new("1.0.0");
    write_config_value(
        &sandbox.paths.config_file,
        &json!({"daemon": {"enabled": true, "port": 8100}}),
    )
    .expect("write live config");
    let legacy = sandbox.paths.legacy_config_candidates()[0].clone();
    fs::create_dir_all(legacy.parent().expect("parent")).expect("mkdir");
    fs::write(&legacy, r#"{"daemon": {"enabled": true, "port": 7000}}"#).expect("write");

    let report = sandbox.orchestrator().install(quiet()).expect("install");
    assert_eq!(report.migration.action, MigrationAction::Skipped);
    assert!(!report.migration.errors.is_empty());
    let config = read_config_value(&sandbox.paths.config_file).expect("config");
    assert_eq!(config["daemon"]["port"], json!(8100));
}

#[test]
fn overwrite_config_takes_a_verified_backup_first() {
    let sandbox = Sandbox::new("1.0.0");
    write_config_value(
        &sandbox.paths.config_file,
        &json!({"daemon": {"enabled": true, "port": 8100}}),
    )
    .expect("write live config");
    let legacy = sandbox.paths.legacy_config_candidates()[0].clone();
    fs::create_dir_all(legacy.parent().expect("parent")).expect("mkdir");
    fs::write(&legacy, r#"{"daemon": {"enabled": true, "port": 7000}}"#).expect("write");

    let report = sandbox
        .orchestrator()
        .install(InstallOptions {
            overwrite_config: true,
            ..quiet()
        })
        .expect("install");
    assert_eq!(report.migration.action, MigrationAction::Overwritten);
    let backup = report.migration.backup_path.clone().expect("backup taken");
    assert!(
        report
            .backups
            .entries()
            .iter()
            .any(|entry| entry.kind == BackupKind::Config && entry.path == backup)
    );
    let saved = read_config_value(&backup).expect("backup readable");
    assert_eq!(saved["daemon"]["port"], json!(8100));
    let config = read_config_value(&sandbox.paths.config_file).expect("config");
    assert_eq!(config["daemon"]["port"], json!(7000));
}

#[test]
fn upgrade_backs_up_then_redeploys() {
    let sandbox = Sandbox::new("1.0.0");
    sandbox.orchestrator().install(quiet()).expect("install");

    write_app_source(&sandbox.source_root, "1.1.0");
    let report = sandbox.orchestrator().install(quiet()).expect("upgrade");
    let DeployOutcome::Deployed {
        manifest,
        backup: Some(backup),
    } = &report.deployment
    else {
        panic!("expected a redeploy with backup");
    };
    assert_eq!(manifest.version.to_string(), "1.1.0");
    assert!(backup.join("main.py").is_file());
    assert_eq!(report.backups.entries()[0].kind, BackupKind::Deployment);

    let pip_log =
        fs::read_to_string(sandbox.paths.runtime_dir.join("pip.log")).expect("pip log");
    assert_eq!(pip_log.lines().count(), 2);
}

#[test]
fn missing_service_tool_reports_remediation_and_keeps_install() {
    let sandbox = Sandbox::new("1.0.0");
    sandbox.registry.lock().unwrap().fail_with_missing_tool = true;

    let err = sandbox
        .orchestrator()
        .install(quiet())
        .expect_err("registration must fail");
    assert!(matches!(
        err,
        InstallError::Service(ServiceRegistrationError::ToolMissing { .. })
    ));
    assert_eq!(err.remediation(), "install svc");
    assert!(sandbox.paths.deploy_dir.join("main.py").is_file());
    assert!(sandbox.paths.config_file.is_file());

    sandbox.registry.lock().unwrap().fail_with_missing_tool = false;
    sandbox.orchestrator().install(quiet()).expect("retry");
    assert!(sandbox.registry.lock().unwrap().installed.is_some());
}

#[test]
fn uninstall_then_reinstall_round_trip() {
    let sandbox = Sandbox::new("1.0.0");
    let orchestrator = sandbox.orchestrator();
    orchestrator.install(quiet()).expect("install");
    assert!(orchestrator.status().expect("status").service_installed);

    orchestrator.uninstall(false).expect("uninstall");
    let status = orchestrator.status().expect("status");
    assert!(!status.service_installed);
    assert!(status.manifest.is_some());
    assert!(!sandbox.paths.bin_dir.exists());

    let report = orchestrator.install(quiet()).expect("reinstall");
    assert!(matches!(report.deployment, DeployOutcome::UpToDate { .. }));
    assert!(sandbox.paths.bin_dir.join("warden-server").is_file());
}

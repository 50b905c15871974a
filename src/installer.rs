//! Install, uninstall, status and restore workflows.
//!
//! [`InstallOrchestrator::install`] runs a strict sequential pipeline and stops at the first
//! failure. Artifacts created by the failing run are removed again, except when the failure is
//! the final service registration: everything before it is usable on its own and stays.
use semver::Version;
use serde::Serialize;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use strum_macros::{AsRefStr, Display};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    config::{
        default_config_value, explicit_enabled, load_daemon_config, read_config_value,
        write_config_value,
    },
    constants::{
        DEFAULT_ENTRY_POINT, MANIFEST_FILE_NAME, REQUIREMENTS_FILE_NAME, SERVER_WRAPPER_NAME,
    },
    deploy::{AppSource, DeployOutcome, PackageDeployer, copy_dir_all, unique_path},
    error::{InstallError, install_io},
    migrate::{
        ConfigMigrator, MigrationOptions, MigrationResult, backup_file, detect_prior_install,
    },
    paths::InstallPaths,
    runtime_env::{CreateOutcome, RuntimeEnvironment},
    service::{
        ServiceDescriptor, ServiceRegistrar, SystemRunner, registrar_for_host, supervisor_binary,
    },
    version::{InstallationManifest, UpgradeStatus, compare, read_manifest_file},
};

/// Builds the host's service registrar for a descriptor.
pub type RegistrarFactory = Box<dyn Fn(ServiceDescriptor) -> Box<dyn ServiceRegistrar>>;

/// Operator choices for [`InstallOrchestrator::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    /// Redeploy even when the installed version matches the source.
    pub force: bool,
    /// Delete and recreate the runtime sandbox.
    pub force_runtime: bool,
    /// Ask before resolving a config conflict.
    pub interactive: bool,
    /// Replace the live config with a prior install's config.
    pub overwrite_config: bool,
    /// Back up files before they are overwritten. Without it, destructive writes are skipped.
    pub backup: bool,
    /// Register and start the OS service at the end.
    pub register_service: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            force: false,
            force_runtime: false,
            interactive: false,
            overwrite_config: false,
            backup: true,
            register_service: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupKind {
    Deployment,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub kind: BackupKind,
    pub path: PathBuf,
}

/// Backups taken during one install, in the order they were made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupLedger {
    entries: Vec<BackupRecord>,
}

impl BackupLedger {
    pub fn record(&mut self, kind: BackupKind, path: impl Into<PathBuf>) {
        self.entries.push(BackupRecord {
            kind,
            path: path.into(),
        });
    }

    pub fn entries(&self) -> &[BackupRecord] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the install did to the live config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    /// No config existed; defaults were written with `enabled: true`.
    Created,
    /// The config had no `daemon` section; the default one was added after a backup.
    DaemonSectionAdded { backup: PathBuf },
    /// The config was left as it was.
    Unchanged,
}

#[derive(Debug)]
pub struct InstallReport {
    pub runtime: CreateOutcome,
    pub runtime_version: Version,
    pub deployment: DeployOutcome,
    pub migration: MigrationResult,
    pub config: ConfigAction,
    pub wrappers: Vec<PathBuf>,
    pub service_registered: bool,
    pub backups: BackupLedger,
}

/// Live pid, memory and uptime of the managed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerProcess {
    pub pid: u32,
    pub memory_bytes: u64,
    pub uptime_seconds: u64,
}

/// Snapshot reported by `warden status`.
#[derive(Debug, Clone, Serialize)]
pub struct InstallStatus {
    pub install_root: PathBuf,
    pub config_path: PathBuf,
    pub manifest: Option<InstallationManifest>,
    pub source_version: Option<Version>,
    pub upgrade: Option<UpgradeStatus>,
    pub runtime_present: bool,
    pub service_platform: String,
    pub service_installed: bool,
    pub service_running: bool,
    pub daemon_enabled: Option<bool>,
    pub server: Option<ServerProcess>,
}

/// Result of [`InstallOrchestrator::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A config backup was copied onto `target`.
    Config {
        target: PathBuf,
        /// Backup of the file that was replaced, if one existed.
        previous: Option<PathBuf>,
    },
    /// A deployment backup was copied onto the deploy directory.
    Deployment {
        version: Option<Version>,
        /// Backup of the deployment that was replaced, if one existed.
        previous: Option<PathBuf>,
    },
}

struct Provisioned {
    runtime: CreateOutcome,
    runtime_version: Version,
    executable: PathBuf,
    entry_point: PathBuf,
    deployment: DeployOutcome,
    migration: MigrationResult,
    config: ConfigAction,
    wrappers: Vec<PathBuf>,
}

/// Sequences runtime, deployment, migration, config and service registration.
pub struct InstallOrchestrator {
    paths: InstallPaths,
    runtime: RuntimeEnvironment,
    source: Option<AppSource>,
    migrator: ConfigMigrator,
    registrar_factory: RegistrarFactory,
    supervisor_source: Option<PathBuf>,
}

impl InstallOrchestrator {
    pub fn new(
        paths: InstallPaths,
        runtime: RuntimeEnvironment,
        registrar_factory: RegistrarFactory,
    ) -> Self {
        Self {
            paths,
            runtime,
            source: None,
            migrator: ConfigMigrator::default(),
            registrar_factory,
            supervisor_source: None,
        }
    }

    /// Orchestrator wired to the real host: resolved paths, `WARDEN_PYTHON`, and the
    /// platform's service manager.
    pub fn for_host() -> Result<Self, InstallError> {
        let paths = InstallPaths::resolve()?;
        let runtime = RuntimeEnvironment::from_env(paths.runtime_dir.clone());
        let home = paths.home.clone();
        let factory: RegistrarFactory = Box::new(move |descriptor| {
            registrar_for_host(descriptor, &home, Arc::new(SystemRunner))
        });
        Ok(Self::new(paths, runtime, factory))
    }

    /// Deploys `source` instead of discovering it from the environment.
    pub fn with_source(mut self, source: AppSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_migrator(mut self, migrator: ConfigMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Binary copied into `bin/` as the service's supervisor. Defaults to the running
    /// executable.
    pub fn with_supervisor_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.supervisor_source = Some(path.into());
        self
    }

    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    /// Registrar for the installed layout. Works whether or not anything is installed.
    pub fn registrar(&self) -> Box<dyn ServiceRegistrar> {
        (self.registrar_factory)(self.descriptor())
    }

    fn descriptor(&self) -> ServiceDescriptor {
        let entry_point = self.source.as_ref().map_or_else(
            || self.paths.deploy_dir.join(DEFAULT_ENTRY_POINT),
            |source| deployed_entry_point(&self.paths, source),
        );
        ServiceDescriptor::for_install(&self.paths, &self.runtime.executable_path(), &entry_point)
    }

    fn resolve_source(&self) -> Result<AppSource, InstallError> {
        match &self.source {
            Some(source) => Ok(source.clone()),
            None => Ok(AppSource::discover()?),
        }
    }

    /// Runs the full install pipeline.
    pub fn install(&self, options: InstallOptions) -> Result<InstallReport, InstallError> {
        let source = self.resolve_source()?;
        info!(
            "Installing version {} from {} into {}",
            source.version,
            source.root.display(),
            self.paths.root.display()
        );

        let host_version = self.runtime.validate_version()?;
        info!("Host runtime {host_version} meets the minimum version");

        let mut created = Vec::new();
        let mut ledger = BackupLedger::default();

        let provisioned = match self
            .create_directories(&mut created)
            .and_then(|()| self.provision(&source, options, &mut created, &mut ledger))
        {
            Ok(provisioned) => provisioned,
            Err(err) => {
                self.discard_created(&created);
                return Err(err);
            }
        };

        let mut service_registered = false;
        if options.register_service {
            let descriptor = ServiceDescriptor::for_install(
                &self.paths,
                &provisioned.executable,
                &provisioned.entry_point,
            );
            let registrar = (self.registrar_factory)(descriptor);
            info!("Registering the supervisor with {}", registrar.platform());
            registrar.install()?;
            service_registered = true;
        } else {
            info!("Skipping service registration");
        }

        Ok(InstallReport {
            runtime: provisioned.runtime,
            runtime_version: provisioned.runtime_version,
            deployment: provisioned.deployment,
            migration: provisioned.migration,
            config: provisioned.config,
            wrappers: provisioned.wrappers,
            service_registered,
            backups: ledger,
        })
    }

    fn create_directories(&self, created: &mut Vec<PathBuf>) -> Result<(), InstallError> {
        for dir in [
            &self.paths.root,
            &self.paths.bin_dir,
            &self.paths.log_dir,
            &self.paths.backup_dir,
        ] {
            if dir.exists() {
                continue;
            }
            fs::create_dir_all(dir).map_err(|source| install_io(dir, source))?;
            created.push(dir.clone());
        }
        Ok(())
    }

    fn provision(
        &self,
        source: &AppSource,
        options: InstallOptions,
        created: &mut Vec<PathBuf>,
        ledger: &mut BackupLedger,
    ) -> Result<Provisioned, InstallError> {
        let runtime_existed = self.runtime.dir().exists();
        let runtime = self.runtime.create(options.force_runtime)?;
        if !runtime_existed {
            created.push(self.runtime.dir().to_path_buf());
        }
        let executable = self.runtime.resolve_executable()?;
        let runtime_version = self.runtime.runtime_version()?;

        let deploy_existed = self.paths.deploy_dir.exists();
        let manifest_existed = self.paths.manifest_file().exists();
        let deployer = PackageDeployer::new(source.clone(), &self.paths)
            .with_runtime_version(runtime_version.to_string());
        let deployment = deployer.deploy(options.force)?;
        if !deploy_existed {
            created.push(self.paths.deploy_dir.clone());
        }
        if !manifest_existed {
            created.push(self.paths.manifest_file());
        }
        if let DeployOutcome::Deployed {
            backup: Some(backup),
            ..
        } = &deployment
        {
            ledger.record(BackupKind::Deployment, backup);
        }

        let requirements = self.paths.deploy_dir.join(REQUIREMENTS_FILE_NAME);
        let refreshed = matches!(deployment, DeployOutcome::Deployed { .. })
            || matches!(runtime, CreateOutcome::Created { .. });
        if source.requirements.is_some() && requirements.is_file() && refreshed {
            self.runtime.install_dependencies(&requirements)?;
        } else {
            debug!("No dependency refresh needed");
        }

        let entry_point = deployed_entry_point(&self.paths, source);
        let wrappers = self.write_wrappers(&executable, &entry_point, created)?;

        let prior = detect_prior_install(
            &self.paths.legacy_config_candidates(),
            &self.paths.config_file,
        );
        let migration = self
            .migrator
            .migrate(
                prior.as_deref(),
                &self.paths.config_file,
                MigrationOptions {
                    interactive: options.interactive,
                    force_overwrite: options.overwrite_config,
                    backup: options.backup,
                },
            )
            .unwrap_or_else(|err| {
                error!("Config migration failed; continuing without it: {err}");
                MigrationResult::failed(prior.as_deref(), &self.paths.config_file, &err)
            });
        for err in &migration.errors {
            warn!("Config migration: {err}");
        }
        if let Some(backup) = &migration.backup_path {
            ledger.record(BackupKind::Config, backup);
        }

        let config = self.ensure_live_config(options.backup, ledger)?;

        Ok(Provisioned {
            runtime,
            runtime_version,
            executable,
            entry_point,
            deployment,
            migration,
            config,
            wrappers,
        })
    }

    /// Writes the server wrapper and the supervisor snapshot into `bin/`.
    fn write_wrappers(
        &self,
        executable: &Path,
        entry_point: &Path,
        created: &mut Vec<PathBuf>,
    ) -> Result<Vec<PathBuf>, InstallError> {
        let (name, script) = if cfg!(windows) {
            (
                format!("{SERVER_WRAPPER_NAME}.cmd"),
                format!(
                    "@echo off\r\n\"{}\" \"{}\" %*\r\n",
                    executable.display(),
                    entry_point.display()
                ),
            )
        } else {
            (
                SERVER_WRAPPER_NAME.to_string(),
                format!(
                    "#!/bin/sh\nexec {} {} \"$@\"\n",
                    shell_quote(&executable.display().to_string()),
                    shell_quote(&entry_point.display().to_string())
                ),
            )
        };

        let wrapper = self.paths.bin_dir.join(name);
        let wrapper_existed = wrapper.exists();
        fs::write(&wrapper, script).map_err(|source| install_io(&wrapper, source))?;
        make_executable(&wrapper)?;
        if !wrapper_existed {
            created.push(wrapper.clone());
        }
        info!("Wrote {}", wrapper.display());

        let snapshot = supervisor_binary(&self.paths);
        let snapshot_existed = snapshot.exists();
        let origin = match &self.supervisor_source {
            Some(path) => path.clone(),
            None => env::current_exe().map_err(|source| install_io(&snapshot, source))?,
        };
        if origin != snapshot {
            // Copy then rename so a running supervisor's binary is replaced, not rewritten.
            let staging = snapshot.with_extension("new");
            fs::copy(&origin, &staging).map_err(|source| install_io(&origin, source))?;
            make_executable(&staging)?;
            fs::rename(&staging, &snapshot).map_err(|source| install_io(&snapshot, source))?;
            if !snapshot_existed {
                created.push(snapshot.clone());
            }
            debug!("Copied supervisor binary to {}", snapshot.display());
        }

        Ok(vec![wrapper, snapshot])
    }

    /// Writes defaults into a fresh config, or adds a missing `daemon` section. A config that
    /// already sets `daemon.enabled` is never touched.
    fn ensure_live_config(
        &self,
        backup: bool,
        ledger: &mut BackupLedger,
    ) -> Result<ConfigAction, InstallError> {
        let path = &self.paths.config_file;
        if !path.exists() {
            write_config_value(path, &default_config_value())?;
            info!("Wrote default config to {}", path.display());
            return Ok(ConfigAction::Created);
        }

        let mut value = read_config_value(path)?;
        if let Some(enabled) = explicit_enabled(&value) {
            info!(
                "Keeping existing config {} (daemon.enabled = {enabled})",
                path.display()
            );
            return Ok(ConfigAction::Unchanged);
        }
        if value.get("daemon").is_some() {
            debug!("Config already has a daemon section; leaving it alone");
            return Ok(ConfigAction::Unchanged);
        }
        if !backup {
            warn!(
                "{} has no daemon section, but backups are disabled; not modifying it",
                path.display()
            );
            return Ok(ConfigAction::Unchanged);
        }

        let defaults = default_config_value();
        let Some(object) = value.as_object_mut() else {
            return Err(InstallError::Precondition(format!(
                "{} must contain a JSON object at the top level",
                path.display()
            )));
        };
        let saved = backup_file(path, "install")?;
        ledger.record(BackupKind::Config, &saved);
        object.insert("daemon".to_string(), defaults["daemon"].clone());
        write_config_value(path, &value)?;

        info!("Added the default daemon section to {}", path.display());
        Ok(ConfigAction::DaemonSectionAdded { backup: saved })
    }

    fn discard_created(&self, created: &[PathBuf]) {
        for path in created.iter().rev() {
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to clean up {}: {err}", path.display()),
            }
        }
    }

    /// Unregisters the service and removes `bin/`. `purge` also removes the runtime, the
    /// deployment and the manifest. Config, logs and backups always stay.
    pub fn uninstall(&self, purge: bool) -> Result<(), InstallError> {
        let registrar = self.registrar();
        registrar.uninstall()?;

        let mut targets = vec![self.paths.bin_dir.clone()];
        if purge {
            targets.push(self.paths.runtime_dir.clone());
            targets.push(self.paths.deploy_dir.clone());
            targets.push(self.paths.manifest_file());
        }

        for target in targets {
            let result = if target.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            match result {
                Ok(()) => info!("Removed {}", target.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(install_io(target, source)),
            }
        }

        info!(
            "Uninstalled; config kept at {} and backups at {}",
            self.paths.config_file.display(),
            self.paths.backup_dir.display()
        );
        Ok(())
    }

    /// Collects the install's current state. Missing pieces are reported, not errors.
    pub fn status(&self) -> Result<InstallStatus, InstallError> {
        let manifest = read_manifest_file(&self.paths.manifest_file())?;

        let source_version = match &self.source {
            Some(source) => Some(source.version.clone()),
            None => AppSource::discover()
                .map(|source| source.version)
                .map_err(|err| debug!("No application source for upgrade check: {err}"))
                .ok(),
        };
        let upgrade = source_version
            .as_ref()
            .map(|version| compare(manifest.as_ref(), version));

        let registrar = self.registrar();
        let (daemon_enabled, server) = match read_config_value(&self.paths.config_file) {
            Ok(value) => {
                let server = load_daemon_config(&self.paths.config_file)
                    .ok()
                    .and_then(|config| config.resolved_pid_file().ok().flatten())
                    .and_then(|pid_file| server_process(&pid_file));
                (explicit_enabled(&value), server)
            }
            Err(err) => {
                debug!("Config unavailable for status: {err}");
                (None, None)
            }
        };

        Ok(InstallStatus {
            install_root: self.paths.root.clone(),
            config_path: self.paths.config_file.clone(),
            manifest,
            source_version,
            upgrade,
            runtime_present: self.runtime.detect(),
            service_platform: registrar.platform().to_string(),
            service_installed: registrar.is_installed(),
            service_running: registrar.is_running(),
            daemon_enabled,
            server,
        })
    }

    /// Puts a backup made by an earlier install back in place. The current target is backed
    /// up first.
    pub fn restore(&self, backup: &Path) -> Result<RestoreOutcome, InstallError> {
        if backup.is_dir() {
            self.restore_deployment(backup)
        } else if backup.is_file() {
            restore_config(backup)
        } else {
            Err(InstallError::Precondition(format!(
                "Backup {} does not exist",
                backup.display()
            )))
        }
    }

    fn restore_deployment(&self, backup: &Path) -> Result<RestoreOutcome, InstallError> {
        let saved_manifest = backup.join(MANIFEST_FILE_NAME);
        let manifest = read_manifest_file(&saved_manifest)?;

        let deploy_dir = &self.paths.deploy_dir;
        let previous = if deploy_dir.exists() {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            let target = unique_path(&self.paths.backup_dir.join(format!("pre-restore-{stamp}")));
            copy_dir_all(deploy_dir, &target).map_err(|source| install_io(&target, source))?;
            let current_manifest = self.paths.manifest_file();
            if current_manifest.exists() {
                fs::copy(&current_manifest, target.join(MANIFEST_FILE_NAME))
                    .map_err(|source| install_io(&current_manifest, source))?;
            }
            info!("Saved current deployment to {}", target.display());
            fs::remove_dir_all(deploy_dir).map_err(|source| install_io(deploy_dir, source))?;
            Some(target)
        } else {
            None
        };

        copy_dir_all(backup, deploy_dir).map_err(|source| install_io(deploy_dir, source))?;
        let copied_manifest = deploy_dir.join(MANIFEST_FILE_NAME);
        if copied_manifest.exists() {
            fs::remove_file(&copied_manifest)
                .map_err(|source| install_io(&copied_manifest, source))?;
        }

        let manifest_path = self.paths.manifest_file();
        if saved_manifest.is_file() {
            fs::copy(&saved_manifest, &manifest_path)
                .map_err(|source| install_io(&manifest_path, source))?;
        } else if manifest_path.exists() {
            fs::remove_file(&manifest_path).map_err(|source| install_io(&manifest_path, source))?;
        }

        let version = manifest.map(|manifest| manifest.version);
        match &version {
            Some(version) => info!("Restored deployment version {version} from {}", backup.display()),
            None => warn!(
                "Restored deployment from {} without a manifest; version unknown",
                backup.display()
            ),
        }
        Ok(RestoreOutcome::Deployment { version, previous })
    }
}

fn restore_config(backup: &Path) -> Result<RestoreOutcome, InstallError> {
    let target = config_backup_origin(backup).ok_or_else(|| {
        InstallError::Precondition(format!(
            "{} is not a config backup (expected <file>.backup-<label>-<timestamp>)",
            backup.display()
        ))
    })?;

    read_config_value(backup)?;

    let previous = if target.exists() {
        Some(backup_file(&target, "pre-restore")?)
    } else {
        None
    };
    fs::copy(backup, &target).map_err(|source| install_io(&target, source))?;

    info!("Restored {} from {}", target.display(), backup.display());
    Ok(RestoreOutcome::Config { target, previous })
}

/// The file a `<name>.backup-<label>-<timestamp>` backup was taken from.
pub fn config_backup_origin(backup: &Path) -> Option<PathBuf> {
    let name = backup.file_name()?.to_str()?;
    let (original, _) = name.split_once(".backup-")?;
    if original.is_empty() {
        return None;
    }
    Some(backup.with_file_name(original))
}

fn deployed_entry_point(paths: &InstallPaths, source: &AppSource) -> PathBuf {
    match source.entry_point.file_name() {
        Some(name) => paths.deploy_dir.join(name),
        None => paths.deploy_dir.join(DEFAULT_ENTRY_POINT),
    }
}

fn server_process(pid_file: &Path) -> Option<ServerProcess> {
    let pid: u32 = fs::read_to_string(pid_file).ok()?.trim().parse().ok()?;
    let pid = Pid::from_u32(pid);

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = system.process(pid)?;

    Some(ServerProcess {
        pid: pid.as_u32(),
        memory_bytes: process.memory(),
        uptime_seconds: process.run_time(),
    })
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|source| install_io(path, source))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ServiceRegistrationError,
        migrate::MigrationAction,
        service::testing::{RecordingRunner, failed},
        service::{CommandRunner, SystemdRegistrar},
    };
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        paths: InstallPaths,
        source_root: PathBuf,
        runner: Arc<RecordingRunner>,
        #[cfg(unix)]
        interpreter: PathBuf,
    }

    fn write_source(root: &Path, version: &str) {
        fs::create_dir_all(root.join("app_pkg")).unwrap();
        fs::write(root.join("app_pkg/__init__.py"), "").unwrap();
        fs::write(root.join("app_pkg/server.py"), "print('hi')\n").unwrap();
        fs::write(root.join("main.py"), "sleep 30\n").unwrap();
        fs::write(root.join("requirements.txt"), "requests\n").unwrap();
        fs::write(root.join("VERSION"), format!("{version}\n")).unwrap();
    }

    #[cfg(unix)]
    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let source_root = dir.path().join("source");
        write_source(&source_root, "1.2.0");
        let tools = dir.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let interpreter = crate::test_utils::write_fake_interpreter(&tools, "3.11.4");

        Fixture {
            paths: InstallPaths::from_home(&home),
            source_root,
            runner: Arc::new(RecordingRunner::with_tools(&["systemctl"])),
            interpreter,
            _dir: dir,
        }
    }

    #[cfg(unix)]
    fn orchestrator(fixture: &Fixture) -> InstallOrchestrator {
        let runtime = RuntimeEnvironment::new(&fixture.paths.runtime_dir, &fixture.interpreter)
            .with_tool_search_path(fixture.interpreter.parent().unwrap().as_os_str());
        let home = fixture.paths.home.clone();
        let runner: Arc<dyn CommandRunner> = fixture.runner.clone();
        let factory: RegistrarFactory = Box::new(move |descriptor| {
            Box::new(SystemdRegistrar::new(descriptor, &home, runner.clone()))
        });
        InstallOrchestrator::new(fixture.paths.clone(), runtime, factory)
            .with_source(AppSource::at(&fixture.source_root).unwrap())
            .with_supervisor_source(&fixture.interpreter)
    }

    #[cfg(unix)]
    #[test]
    fn fresh_install_lays_out_everything() {
        let fixture = fixture();
        let report = orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap();

        assert!(matches!(report.runtime, CreateOutcome::Created { .. }));
        assert_eq!(report.runtime_version, Version::new(3, 11, 4));
        assert!(matches!(report.deployment, DeployOutcome::Deployed { .. }));
        assert_eq!(report.config, ConfigAction::Created);
        assert!(report.service_registered);
        assert!(report.backups.is_empty());

        let paths = &fixture.paths;
        assert!(paths.deploy_dir.join("app_pkg/__init__.py").is_file());
        assert!(paths.manifest_file().is_file());
        assert!(paths.runtime_dir.join("pip.log").is_file());
        assert!(paths.bin_dir.join(SERVER_WRAPPER_NAME).is_file());
        assert!(supervisor_binary(paths).is_file());

        let config = read_config_value(&paths.config_file).unwrap();
        assert_eq!(explicit_enabled(&config), Some(true));
        assert!(config.get("_comment").is_some());

        let wrapper = fs::read_to_string(paths.bin_dir.join(SERVER_WRAPPER_NAME)).unwrap();
        assert!(wrapper.contains(&paths.runtime_dir.join("bin/python").display().to_string()));
        assert!(
            fixture
                .runner
                .calls()
                .contains(&"systemctl --user restart warden.service".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn corrupt_prior_config_does_not_abort_install() {
        let fixture = fixture();
        let legacy = fixture.paths.home.join(".warden/config.json");
        fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        fs::write(&legacy, "{ not json").unwrap();

        let report = orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap();

        assert_eq!(report.migration.action, MigrationAction::Skipped);
        assert!(!report.migration.migrated);
        assert_eq!(report.migration.source_path.as_deref(), Some(legacy.as_path()));
        assert_eq!(report.migration.errors.len(), 1);
        assert_eq!(report.config, ConfigAction::Created);
        assert!(report.service_registered);
        assert_eq!(fs::read_to_string(&legacy).unwrap(), "{ not json");

        let paths = &fixture.paths;
        assert!(paths.deploy_dir.join("main.py").is_file());
        assert!(paths.runtime_dir.is_dir());
        assert_eq!(
            explicit_enabled(&read_config_value(&paths.config_file).unwrap()),
            Some(true)
        );
    }

    #[cfg(unix)]
    #[test]
    fn reinstall_same_version_keeps_enabled_config() {
        let fixture = fixture();
        let installer = orchestrator(&fixture);
        installer.install(InstallOptions::default()).unwrap();

        let mut config = read_config_value(&fixture.paths.config_file).unwrap();
        config["daemon"]["port"] = json!(9100);
        write_config_value(&fixture.paths.config_file, &config).unwrap();

        let report = installer.install(InstallOptions::default()).unwrap();
        assert!(matches!(report.deployment, DeployOutcome::UpToDate { .. }));
        assert_eq!(report.runtime, CreateOutcome::AlreadyExists);
        assert_eq!(report.config, ConfigAction::Unchanged);
        let config = read_config_value(&fixture.paths.config_file).unwrap();
        assert_eq!(config["daemon"]["port"], json!(9100));
    }

    #[cfg(unix)]
    #[test]
    fn explicit_disable_survives_upgrade() {
        let fixture = fixture();
        let installer = orchestrator(&fixture);
        installer.install(InstallOptions::default()).unwrap();

        let mut config = read_config_value(&fixture.paths.config_file).unwrap();
        config["daemon"]["enabled"] = json!(false);
        write_config_value(&fixture.paths.config_file, &config).unwrap();
        write_source(&fixture.source_root, "1.3.0");

        let installer = orchestrator(&fixture);
        let report = installer.install(InstallOptions::default()).unwrap();
        assert!(matches!(
            report.deployment,
            DeployOutcome::Deployed { backup: Some(_), .. }
        ));
        assert_eq!(report.backups.entries()[0].kind, BackupKind::Deployment);
        let config = read_config_value(&fixture.paths.config_file).unwrap();
        assert_eq!(explicit_enabled(&config), Some(false));
    }

    #[cfg(unix)]
    #[test]
    fn missing_daemon_section_is_added_after_backup() {
        let fixture = fixture();
        write_config_value(&fixture.paths.config_file, &json!({"theme": "dark"})).unwrap();

        let report = orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap();
        let ConfigAction::DaemonSectionAdded { backup } = report.config else {
            panic!("expected the daemon section to be added");
        };
        assert_eq!(
            fs::read_to_string(&backup).unwrap().trim(),
            serde_json::to_string_pretty(&json!({"theme": "dark"})).unwrap()
        );
        let config = read_config_value(&fixture.paths.config_file).unwrap();
        assert_eq!(config["theme"], json!("dark"));
        assert_eq!(explicit_enabled(&config), Some(true));
    }

    #[cfg(unix)]
    #[test]
    fn old_runtime_aborts_before_creating_anything() {
        let fixture = fixture();
        crate::test_utils::write_fake_interpreter(fixture.interpreter.parent().unwrap(), "3.8.10");

        let err = orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Environment(crate::error::EnvironmentError::IncompatibleVersion { .. })
        ));
        assert!(err.remediation().contains("3.10.0"));
        assert!(!fixture.paths.root.exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_deployment_cleans_up_this_run() {
        let fixture = fixture();
        fs::remove_file(fixture.source_root.join("main.py")).unwrap();

        let err = orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, InstallError::Deployment(_)));
        assert!(!fixture.paths.deploy_dir.exists());
        assert!(!fixture.paths.runtime_dir.exists());
        assert!(!fixture.paths.root.exists());
    }

    #[cfg(unix)]
    #[test]
    fn service_failure_keeps_artifacts() {
        let fixture = fixture();
        fixture
            .runner
            .respond("systemctl --user restart", failed("unit failed"));

        let err = orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Service(ServiceRegistrationError::CommandFailed { .. })
        ));
        assert!(fixture.paths.deploy_dir.join("main.py").is_file());
        assert!(fixture.paths.config_file.is_file());
        assert!(fixture.paths.runtime_dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn uninstall_keeps_config_and_backups() {
        let fixture = fixture();
        let installer = orchestrator(&fixture);
        installer.install(InstallOptions::default()).unwrap();
        fs::write(fixture.paths.backup_dir.join("keep.txt"), "x").unwrap();

        installer.uninstall(true).unwrap();
        assert!(!fixture.paths.bin_dir.exists());
        assert!(!fixture.paths.runtime_dir.exists());
        assert!(!fixture.paths.deploy_dir.exists());
        assert!(!fixture.paths.manifest_file().exists());
        assert!(fixture.paths.config_file.is_file());
        assert!(fixture.paths.backup_dir.join("keep.txt").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn status_reports_manifest_and_config() {
        let fixture = fixture();
        let installer = orchestrator(&fixture);
        installer
            .install(InstallOptions {
                register_service: false,
                ..InstallOptions::default()
            })
            .unwrap();

        let status = installer.status().unwrap();
        assert_eq!(
            status.manifest.map(|manifest| manifest.version),
            Some(Version::new(1, 2, 0))
        );
        assert_eq!(status.source_version, Some(Version::new(1, 2, 0)));
        assert!(!status.upgrade.unwrap().upgrade_available);
        assert!(status.runtime_present);
        assert_eq!(status.service_platform, "systemd");
        assert!(!status.service_installed);
        assert_eq!(status.daemon_enabled, Some(true));
        assert!(status.server.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn restore_deployment_backup_brings_back_version() {
        let fixture = fixture();
        orchestrator(&fixture)
            .install(InstallOptions::default())
            .unwrap();
        write_source(&fixture.source_root, "2.0.0");
        let installer = orchestrator(&fixture);
        let report = installer.install(InstallOptions::default()).unwrap();
        let backup = report.backups.entries()[0].path.clone();

        let outcome = installer.restore(&backup).unwrap();
        let RestoreOutcome::Deployment { version, previous } = outcome else {
            panic!("expected a deployment restore");
        };
        assert_eq!(version, Some(Version::new(1, 2, 0)));
        assert!(previous.unwrap().join(MANIFEST_FILE_NAME).is_file());
        let manifest = read_manifest_file(&fixture.paths.manifest_file())
            .unwrap()
            .unwrap();
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert!(!fixture.paths.deploy_dir.join(MANIFEST_FILE_NAME).exists());
    }

    #[test]
    fn restore_config_backup_saves_current_first() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        fs::write(&config, r#"{"daemon": {"enabled": false}}"#).unwrap();
        let backup = backup_file(&config, "test").unwrap();
        fs::write(&config, r#"{"daemon": {"enabled": true}}"#).unwrap();

        let outcome = restore_config(&backup).unwrap();
        let RestoreOutcome::Config { target, previous } = outcome else {
            panic!("expected a config restore");
        };
        assert_eq!(target, config);
        assert_eq!(
            explicit_enabled(&read_config_value(&config).unwrap()),
            Some(false)
        );
        assert!(
            fs::read_to_string(previous.unwrap())
                .unwrap()
                .contains("true")
        );
    }

    #[test]
    fn backup_origin_strips_suffix() {
        assert_eq!(
            config_backup_origin(Path::new("/x/config.json.backup-install-20250101-101010")),
            Some(PathBuf::from("/x/config.json"))
        );
        assert_eq!(config_backup_origin(Path::new("/x/config.json")), None);
    }

    #[test]
    fn wrapper_quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/a b/it's"), r"'/a b/it'\''s'");
    }
}

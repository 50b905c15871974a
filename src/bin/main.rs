use std::{error::Error, path::PathBuf, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden::{
    bootstrap::BootstrapService,
    cli::{Cli, Commands, parse_args},
    constants::DEFAULT_ENTRY_POINT,
    deploy::DeployOutcome,
    error::InstallError,
    installer::{ConfigAction, InstallOptions, InstallOrchestrator, InstallStatus, RestoreOutcome},
    paths::InstallPaths,
    process::LaunchTarget,
    runtime_env::RuntimeEnvironment,
    service::ServiceRegistrar,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match dispatch(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            if let Some(install_err) = err.downcast_ref::<InstallError>() {
                error!("{}", install_err.remediation());
            }
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Install {
            force,
            force_runtime,
            yes,
            overwrite_config,
            no_backup,
            no_service,
        } => install(InstallOptions {
            force,
            force_runtime,
            interactive: !yes,
            overwrite_config,
            backup: !no_backup,
            register_service: !no_service,
        }),
        Commands::Uninstall { purge } => {
            InstallOrchestrator::for_host()?.uninstall(purge)?;
            Ok(())
        }
        Commands::Status { json } => {
            let status = InstallOrchestrator::for_host()?.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Commands::Logs { follow, lines } => {
            InstallOrchestrator::for_host()?
                .registrar()
                .show_logs(follow, lines)?;
            Ok(())
        }
        Commands::Run {
            config,
            runtime,
            entry_point,
            working_dir,
        } => run_supervisor(config, runtime, entry_point, working_dir),
        Commands::Restore { backup } => {
            match InstallOrchestrator::for_host()?.restore(&backup)? {
                RestoreOutcome::Config { target, previous } => {
                    println!("Restored {}", target.display());
                    if let Some(previous) = previous {
                        println!("Previous config saved to {}", previous.display());
                    }
                }
                RestoreOutcome::Deployment { version, previous } => {
                    let version = version.map_or_else(|| "unknown".to_string(), |v| v.to_string());
                    println!("Restored deployment version {version}");
                    if let Some(previous) = previous {
                        println!("Previous deployment saved to {}", previous.display());
                    }
                }
            }
            Ok(())
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn install(options: InstallOptions) -> Result<(), Box<dyn Error>> {
    let report = InstallOrchestrator::for_host()?.install(options)?;

    match &report.deployment {
        DeployOutcome::UpToDate { version } => {
            println!("Version {version} is already installed")
        }
        DeployOutcome::Deployed { manifest, .. } => println!(
            "Installed version {} ({} files)",
            manifest.version, manifest.total_files
        ),
    }
    println!("Runtime: {}", report.runtime_version);
    match &report.config {
        ConfigAction::Created => println!("Config: wrote defaults (server enabled)"),
        ConfigAction::DaemonSectionAdded { backup } => println!(
            "Config: added daemon settings (backup at {})",
            backup.display()
        ),
        ConfigAction::Unchanged => println!("Config: kept existing settings"),
    }
    for error in &report.migration.errors {
        warn!("{error}");
    }
    for backup in report.backups.entries() {
        println!("Backup ({}): {}", backup.kind, backup.path.display());
    }
    if report.service_registered {
        println!("Background service registered and started");
    }
    Ok(())
}

fn run_supervisor(
    config: Option<PathBuf>,
    runtime: Option<PathBuf>,
    entry_point: Option<PathBuf>,
    working_dir: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let paths = InstallPaths::resolve()?;
    let target = LaunchTarget {
        executable: runtime.unwrap_or_else(|| {
            RuntimeEnvironment::from_env(paths.runtime_dir.clone()).executable_path()
        }),
        entry_point: entry_point.unwrap_or_else(|| paths.deploy_dir.join(DEFAULT_ENTRY_POINT)),
        working_dir: working_dir.unwrap_or_else(|| paths.deploy_dir.clone()),
    };
    let config_path = config.unwrap_or_else(|| paths.config_file.clone());

    info!(
        "Supervising {} {}",
        target.executable.display(),
        target.entry_point.display()
    );
    let mut service = BootstrapService::new(config_path, target);
    service.install_signal_handler()?;
    service.run();
    Ok(())
}

fn print_status(status: &InstallStatus) {
    match &status.manifest {
        Some(manifest) => {
            println!("Installed version: {}", manifest.version);
            println!("Installed at:      {}", manifest.installed_at.to_rfc3339());
            println!("Source commit:     {}", manifest.source_commit);
            println!("Runtime version:   {}", manifest.runtime_version);
        }
        None => println!("Installed version: not installed"),
    }
    if let (Some(source), Some(upgrade)) = (&status.source_version, &status.upgrade) {
        let note = if upgrade.upgrade_available {
            " (upgrade available)"
        } else {
            ""
        };
        println!("Source version:    {source}{note}");
    }
    println!("Install root:      {}", status.install_root.display());
    println!("Config:            {}", status.config_path.display());
    let enabled = match status.daemon_enabled {
        Some(true) => "enabled",
        Some(false) => "disabled",
        None => "not set",
    };
    println!("Server:            {enabled}");
    println!(
        "Service ({}):  installed={} running={}",
        status.service_platform, status.service_installed, status.service_running
    );
    if let Some(server) = &status.server {
        println!(
            "Process:           pid {} | {} KiB | up {}s",
            server.pid,
            server.memory_bytes / 1024,
            server.uptime_seconds
        );
    }
}

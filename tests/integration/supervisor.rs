#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use common::{
    fake_tools, is_process_alive, wait_for_new_pid, wait_for_process_exit, wait_for_removed,
    write_daemon_config,
};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tempfile::tempdir;
use warden::{bootstrap::BootstrapService, process::LaunchTarget};

struct RunningSupervisor {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RunningSupervisor {
    fn spawn(dir: &Path, script: &str) -> Self {
        let (_, interpreter) = fake_tools(dir, "3.12.1");
        let entry_point = dir.join("main.py");
        fs::write(&entry_point, script).expect("failed to write entry point");

        let mut service = BootstrapService::new(
            dir.join("config.json"),
            LaunchTarget {
                executable: interpreter,
                entry_point,
                working_dir: dir.to_path_buf(),
            },
        );
        let running = service.shutdown_handle();
        let thread = thread::spawn(move || service.run());
        Self { running, thread }
    }

    fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        self.thread.join().expect("supervisor thread panicked");
    }
}

#[test]
fn config_toggles_start_and_stop_the_server() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = dir.join("config.json");
    let pid_file = dir.join("server.pid");
    write_daemon_config(&config, true, &pid_file, 0);

    let supervisor = RunningSupervisor::spawn(dir, "sleep 30\n");

    let first = wait_for_new_pid(&pid_file, None);
    assert!(is_process_alive(first));

    write_daemon_config(&config, false, &pid_file, 10);
    wait_for_removed(&pid_file);
    wait_for_process_exit(first);

    write_daemon_config(&config, true, &pid_file, 20);
    let second = wait_for_new_pid(&pid_file, Some(first));
    assert!(is_process_alive(second));

    supervisor.shutdown();
    wait_for_process_exit(second);
    assert!(!pid_file.exists());
}

#[test]
fn crashed_server_is_restarted_with_new_pid() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = dir.join("config.json");
    let pid_file = dir.join("server.pid");
    write_daemon_config(&config, true, &pid_file, 0);

    let supervisor = RunningSupervisor::spawn(dir, "sleep 1\nexit 3\n");

    let first = wait_for_new_pid(&pid_file, None);
    let second = wait_for_new_pid(&pid_file, Some(first));
    assert_ne!(first, second);

    supervisor.shutdown();
}

#[test]
fn killed_server_is_restarted() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = dir.join("config.json");
    let pid_file = dir.join("server.pid");
    write_daemon_config(&config, true, &pid_file, 0);

    let supervisor = RunningSupervisor::spawn(dir, "sleep 30\n");

    let first = wait_for_new_pid(&pid_file, None);
    killpg(Pid::from_raw(first as i32), Signal::SIGKILL).expect("failed to kill server group");

    let second = wait_for_new_pid(&pid_file, Some(first));
    assert!(is_process_alive(second));

    supervisor.shutdown();
    wait_for_process_exit(second);
}

#[test]
fn disabled_config_never_spawns() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = dir.join("config.json");
    let pid_file = dir.join("server.pid");
    write_daemon_config(&config, false, &pid_file, 0);

    let supervisor = RunningSupervisor::spawn(dir, "sleep 30\n");
    thread::sleep(std::time::Duration::from_millis(1500));
    assert!(!pid_file.exists());

    supervisor.shutdown();
}

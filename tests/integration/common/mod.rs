#![allow(dead_code)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant, SystemTime},
};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Writes a minimal application checkout: one package, an entry point, requirements and a
/// `VERSION` file.
pub fn write_app_source(root: &Path, version: &str) {
    fs::create_dir_all(root.join("demo_server/handlers")).expect("failed to create package");
    fs::write(root.join("demo_server/__init__.py"), "").expect("failed to write marker");
    fs::write(root.join("demo_server/handlers/__init__.py"), "")
        .expect("failed to write marker");
    fs::write(root.join("demo_server/app.py"), "print('serving')\n")
        .expect("failed to write module");
    fs::write(root.join("main.py"), "sleep 30\n").expect("failed to write entry point");
    fs::write(root.join("requirements.txt"), "fastmcp\n").expect("failed to write requirements");
    fs::write(root.join("VERSION"), format!("{version}\n")).expect("failed to write VERSION");
}

/// Writes a live config whose `daemon` section polls every second.
pub fn write_daemon_config(path: &Path, enabled: bool, pid_file: &Path, mtime_offset: u64) {
    let document = serde_json::json!({
        "daemon": {
            "enabled": enabled,
            "config_poll_seconds": 1,
            "health_check_interval_seconds": 1,
            "pid_file": pid_file.display().to_string(),
        }
    });
    fs::write(
        path,
        serde_json::to_string_pretty(&document).expect("failed to render config"),
    )
    .expect("failed to write config");

    // Distinct synthetic mtimes so edits inside one second are still observed.
    File::options()
        .write(true)
        .open(path)
        .expect("failed to open config")
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + mtime_offset))
        .expect("failed to set mtime");
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_removed(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to be removed", path);
}

/// Reads a pid file, waiting until it holds a pid other than `previous`.
pub fn wait_for_new_pid(pid_file: &Path, previous: Option<u32>) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(contents) = fs::read_to_string(pid_file)
            && let Ok(pid) = contents.trim().parse::<u32>()
            && Some(pid) != previous
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a new pid in {:?}", pid_file);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for PID {} to exit", pid);
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
}

/// Directory holding a fake interpreter, for use as a tool search path.
#[cfg(unix)]
pub fn fake_tools(root: &Path, version: &str) -> (PathBuf, PathBuf) {
    let tools = root.join("tools");
    fs::create_dir_all(&tools).expect("failed to create tools dir");
    let interpreter = warden::test_utils::write_fake_interpreter(&tools, version);
    (tools, interpreter)
}

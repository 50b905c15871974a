use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables (especially HOME) should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes a shell script that answers like a Python interpreter of `version`.
///
/// It understands `--version`, `-m venv DIR` (lays out a sandbox containing a copy of
/// itself), `-m pip ...` (appended to `<sandbox>/pip.log`) and runs `*.py` files with
/// `/bin/sh`.
#[cfg(unix)]
pub fn write_fake_interpreter(dir: &Path, version: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("python3");
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "Python {version}"
  exit 0
fi
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  printf 'home = /usr/bin\nversion = {version}\n' > "$3/pyvenv.cfg"
  cp "$0" "$3/bin/python"
  chmod +x "$3/bin/python"
  : > "$3/bin/activate"
  exit 0
fi
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
  echo "$*" >> "$(dirname "$0")/../pip.log"
  exit 0
fi
case "$1" in
  *.py) exec /bin/sh "$@" ;;
esac
exit 0
"#
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

//! Log file helpers: size-based rotation for the child log and tailing for `warden logs`.
use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use tracing::{debug, info, warn};

use crate::constants::LOG_FOLLOW_INTERVAL;

/// Rotates `log_path` if it is at least `max_bytes` long.
///
/// `<name>.<backup_count>` is dropped, every `<name>.<n>` shifts to `<name>.<n+1>`, the live
/// file becomes `<name>.1`, and a fresh empty file takes its place. With a `backup_count`
/// of zero the live file is simply truncated. Returns `true` when a rotation happened.
pub fn rotate_if_needed(
    log_path: &Path,
    max_bytes: u64,
    backup_count: usize,
) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if max_bytes == 0 || size < max_bytes {
        return Ok(false);
    }

    if backup_count > 0 {
        let oldest = numbered_path(log_path, backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for n in (1..backup_count).rev() {
            let src = numbered_path(log_path, n);
            if src.exists() {
                fs::rename(&src, numbered_path(log_path, n + 1))?;
            }
        }

        fs::rename(log_path, numbered_path(log_path, 1))?;
    }

    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;

    info!(path = %log_path.display(), "log file rotated");
    Ok(true)
}

/// Path of the `n`-th rotated copy of `base` (e.g. `server.log.2`).
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("server.log");
    base.with_file_name(format!("{name}.{n}"))
}

/// Bytes read per backward step when tailing.
const TAIL_CHUNK: u64 = 8 * 1024;

/// Reads the last `lines` lines of a file.
///
/// Reads backwards from the end, so only the tail of an unrotated service log is loaded.
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let mut start = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();

    while start > 0 {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        let body = buf.strip_suffix(b"\n").unwrap_or(&buf);
        if body.iter().filter(|byte| **byte == b'\n').count() >= lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let all_lines: Vec<&str> = text.lines().collect();
    let first = all_lines.len().saturating_sub(lines);
    Ok(all_lines[first..].iter().map(|line| line.to_string()).collect())
}

/// Prints the tail of each log file, optionally following them until `stop` is set.
///
/// Missing files are reported and skipped so one absent stream does not hide the other.
pub fn show_files(
    paths: &[PathBuf],
    lines: usize,
    follow: bool,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut offsets = Vec::with_capacity(paths.len());

    for path in paths {
        if !path.exists() {
            warn!("Log file {} not found", path.display());
            offsets.push(0);
            continue;
        }

        if paths.len() > 1 {
            writeln!(out, "==> {} <==", path.display())?;
        }
        for line in tail_lines(path, lines)? {
            writeln!(out, "{line}")?;
        }
        offsets.push(fs::metadata(path)?.len());
    }
    out.flush()?;
    drop(out);

    if !follow {
        return Ok(());
    }

    debug!("Following {} log file(s)", paths.len());
    while !stop.load(Ordering::SeqCst) {
        for (path, offset) in paths.iter().zip(offsets.iter_mut()) {
            *offset = print_appended(path, *offset)?;
        }
        thread::sleep(LOG_FOLLOW_INTERVAL);
    }

    Ok(())
}

/// Prints anything written to `path` past `offset` and returns the new offset.
fn print_appended(path: &Path, offset: u64) -> io::Result<u64> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    // Rotated underneath us; start over from the top of the new file.
    let start = if len < offset { 0 } else { offset };
    if len == start {
        return Ok(len);
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut chunk = Vec::new();
    file.take(len - start).read_to_end(&mut chunk)?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&chunk)?;
    stdout.flush()?;
    Ok(len)
}

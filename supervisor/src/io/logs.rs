//! Per-script log files: one deterministic path per (tenant, name).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::text::tail_chars;
use crate::core::types::ScriptKey;

/// Worst-case UTF-8 width; tails read this many bytes per requested char.
const MAX_CHAR_BYTES: u64 = 4;

pub fn log_path(logs_dir: &Path, key: &ScriptKey) -> PathBuf {
    logs_dir.join(format!("{}.log", key.file_stem()))
}

/// Create (or truncate) the log file for a fresh launch attempt.
pub fn open_truncated(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))
}

/// Last `max_chars` characters of the log, decoded lossily. Missing logs read as empty.
pub fn read_tail(path: &Path, max_chars: usize) -> Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err).with_context(|| format!("open log {}", path.display())),
    };
    let len = file
        .metadata()
        .with_context(|| format!("stat log {}", path.display()))?
        .len();
    let window = (max_chars as u64).saturating_mul(MAX_CHAR_BYTES);
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek log {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("read log {}", path.display()))?;
    let text = String::from_utf8_lossy(&buf);
    Ok(tail_chars(&text, max_chars).to_string())
}

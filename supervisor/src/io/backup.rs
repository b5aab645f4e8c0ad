//! Rotating copies of the ledger file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

const BACKUP_PREFIX: &str = "bk_";

/// Copy `source` into `backup_dir` as `bk_<timestamp>.<ext>` and delete all but
/// the newest `keep` backups. Returns the new backup path, or `None` when
/// there is nothing to back up.
pub fn backup_file(source: &Path, backup_dir: &Path, keep: usize) -> Result<Option<PathBuf>> {
    if !source.is_file() {
        debug!(source = %source.display(), "nothing to back up");
        return Ok(None);
    }
    fs::create_dir_all(backup_dir)
        .with_context(|| format!("create backup dir {}", backup_dir.display()))?;

    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bak");
    let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
    let target = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}.{ext}"));
    fs::copy(source, &target)
        .with_context(|| format!("copy {} to {}", source.display(), target.display()))?;
    info!(target = %target.display(), "ledger backed up");

    prune(backup_dir, keep)?;
    Ok(Some(target))
}

fn prune(backup_dir: &Path, keep: usize) -> Result<()> {
    let mut backups: Vec<PathBuf> = fs::read_dir(backup_dir)
        .with_context(|| format!("read backup dir {}", backup_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX))
        })
        .collect();
    // Timestamped names sort chronologically.
    backups.sort();
    let excess = backups.len().saturating_sub(keep);
    for old in backups.into_iter().take(excess) {
        fs::remove_file(&old).with_context(|| format!("remove backup {}", old.display()))?;
        debug!(path = %old.display(), "pruned backup");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_source_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = backup_file(&temp.path().join("none.json"), &temp.path().join("bk"), 3)
            .expect("backup");
        assert!(result.is_none());
        assert!(!temp.path().join("bk").exists());
    }

    #[test]
    fn keeps_only_newest_backups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("scripts.json");
        fs::write(&source, "{}").expect("write source");
        let dir = temp.path().join("backups");
        fs::create_dir_all(&dir).expect("mkdir");
        for old in ["bk_20200101_000000.000.json", "bk_20200102_000000.000.json"] {
            fs::write(dir.join(old), "{}").expect("seed");
        }
        fs::write(dir.join("notes.txt"), "keep me").expect("seed");

        let created = backup_file(&source, &dir, 2).expect("backup").expect("created");

        assert!(created.exists());
        assert!(!dir.join("bk_20200101_000000.000.json").exists());
        assert!(dir.join("bk_20200102_000000.000.json").exists());
        assert!(dir.join("notes.txt").exists());
    }
}

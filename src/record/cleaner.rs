//! Segment cleaner
//!
//! Deletes recorded segments once they are older than the configured
//! retention of their path entry. One cleaner runs per manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::conf::Conf;

pub(crate) struct CleanEntry {
    pub dir: PathBuf,
    pub delete_after: Duration,
}

/// Periodic deletion task.
pub struct Cleaner {
    token: CancellationToken,
}

impl Cleaner {
    /// Returns `None` when no path entry has a retention configured.
    pub(crate) fn spawn(conf: &Conf, token: CancellationToken) -> Option<Self> {
        let entries: Vec<CleanEntry> = conf
            .entries
            .iter()
            .filter(|e| e.conf.record && !e.conf.record_delete_after.is_zero())
            .map(|e| CleanEntry {
                dir: base_dir(&e.conf.record_path),
                delete_after: e.conf.record_delete_after,
            })
            .collect();

        if entries.is_empty() {
            return None;
        }

        let interval = entries
            .iter()
            .map(|e| e.delete_after / 2)
            .min()
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_secs(1));

        let loop_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => clean_once(&entries),
                    _ = loop_token.cancelled() => break,
                }
            }
        });

        Some(Self { token })
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Directory part of a record path template, up to the first templated
/// component.
fn base_dir(record_path: &str) -> PathBuf {
    let mut dir = PathBuf::new();
    for component in Path::new(record_path).components() {
        if component.as_os_str().to_string_lossy().contains('%') {
            break;
        }
        dir.push(component);
    }
    dir
}

pub(crate) fn clean_once(entries: &[CleanEntry]) {
    let now = SystemTime::now();
    for entry in entries {
        clean_dir(&entry.dir, entry.delete_after, now);
    }
}

fn clean_dir(dir: &Path, delete_after: Duration, now: SystemTime) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };

    for dirent in read_dir.flatten() {
        let path = dirent.path();
        if path.is_dir() {
            clean_dir(&path, delete_after, now);
            continue;
        }

        let is_segment = path
            .extension()
            .is_some_and(|ext| ext == "mp4" || ext == "ts");
        if !is_segment {
            continue;
        }

        let expired = dirent
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .is_some_and(|age| age > delete_after);

        if expired {
            tracing::info!(path = %path.display(), "removing expired segment");
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_dir() {
        assert_eq!(
            base_dir("/rec/%path/%Y-%m-%d"),
            PathBuf::from("/rec")
        );
        assert_eq!(
            base_dir("/a/b/%Y/%m"),
            PathBuf::from("/a/b")
        );
    }

    #[test]
    fn test_clean_once_removes_expired_only() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("mypath");
        fs::create_dir_all(&nested).unwrap();

        let old = nested.join("old.mp4");
        let fresh = nested.join("fresh.mp4");
        let unrelated = nested.join("notes.txt");
        fs::write(&old, b"x").unwrap();
        fs::write(&fresh, b"x").unwrap();
        fs::write(&unrelated, b"x").unwrap();

        std::thread::sleep(Duration::from_millis(50));
        fs::write(&fresh, b"xy").unwrap(); // refresh mtime

        clean_once(&[CleanEntry {
            dir: dir.path().to_path_buf(),
            delete_after: Duration::from_millis(25),
        }]);

        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}

//! Directory scanning and the stability/sidecar-race admission gates shared by the
//! startup scan and the live watcher.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, trace};
use walkdir::WalkDir;

pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(1);
pub const STABILITY_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const SIDECAR_RACE_TIMEOUT: Duration = Duration::from_secs(1);
pub const SIDECAR_RACE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Enumerate files under `dir`. Recurses when `recursive` is set; otherwise only the
/// top level is yielded. Hidden entries and the `archive/`, `failed/`, `dlq/` sink
/// directories are skipped so the scanner never re-admits its own output.
pub fn scan_dir(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| !is_sink_dir(entry.path()))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn is_sink_dir(path: &Path) -> bool {
    matches!(path.file_name().and_then(|n| n.to_str()), Some("archive" | "failed" | "dlq"))
}

/// Poll a file's size twice, `stability_window` apart; admissible once it stops changing.
/// Returns `None` if the file disappears mid-check (e.g. a racing delete).
pub async fn wait_for_stable_size(path: &Path, stability_window: Duration) -> Option<u64> {
    loop {
        let first = tokio::fs::metadata(path).await.ok()?.len();
        sleep(stability_window).await;
        let second = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return None,
        };
        if first == second {
            trace!(path = %path.display(), size = second, "file size stabilized");
            return Some(second);
        }
        debug!(path = %path.display(), from = first, to = second, "file still growing, re-checking");
    }
}

/// Poll for a sidecar path (e.g. `<input>.key`) to appear, for up to `SIDECAR_RACE_TIMEOUT`.
pub async fn wait_for_sidecar(sidecar_path: &Path) -> bool {
    let mut waited = Duration::ZERO;
    while waited < SIDECAR_RACE_TIMEOUT {
        if tokio::fs::metadata(sidecar_path).await.is_ok() {
            return true;
        }
        sleep(SIDECAR_RACE_POLL_INTERVAL).await;
        waited += SIDECAR_RACE_POLL_INTERVAL;
    }
    tokio::fs::metadata(sidecar_path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_dir_finds_files_non_recursive() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"a").await.unwrap();
        let nested = dir.path().join("nested");
        tokio::fs::create_dir(&nested).await.unwrap();
        tokio::fs::write(nested.join("b.txt"), b"b").await.unwrap();

        let found = scan_dir(dir.path(), false);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn scan_dir_skips_sink_directories() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        tokio::fs::create_dir(&archive).await.unwrap();
        tokio::fs::write(archive.join("done.enc"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("pending.txt"), b"y").await.unwrap();

        let found = scan_dir(dir.path(), true);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("pending.txt"));
    }

    #[tokio::test]
    async fn wait_for_sidecar_detects_file_written_during_poll() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("input.txt.key");
        let sidecar_clone = sidecar.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            tokio::fs::write(&sidecar_clone, b"vault:v1:abcd").await.unwrap();
        });

        assert!(wait_for_sidecar(&sidecar).await);
    }

    #[tokio::test]
    async fn wait_for_sidecar_times_out_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("never.key");
        assert!(!wait_for_sidecar(&sidecar).await);
    }

    #[tokio::test]
    async fn wait_for_stable_size_honors_a_configured_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing.txt");
        tokio::fs::write(&path, b"a").await.unwrap();

        let size = wait_for_stable_size(&path, Duration::from_millis(50)).await;
        assert_eq!(size, Some(1));
    }
}

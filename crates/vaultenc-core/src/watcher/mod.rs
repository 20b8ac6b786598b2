//! Filesystem event source: classifies `notify` events, pairs `.enc`/`.key` files, and
//! admits ready work into the queue. Runs the startup scan so pre-existing files are
//! never dropped.

pub mod scanner;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::queue::{OperationKind, WorkItem, WorkQueue};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to initialize filesystem watcher: {0}")]
    Init(#[from] notify::Error),
    #[error("failed to stat candidate file {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One side (encrypt or decrypt) of the watcher's directory configuration.
#[derive(Debug, Clone)]
pub struct WatchDirConfig {
    pub operation: OperationKind,
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub recursive: bool,
}

/// Hot-reloadable set of directories the watcher admits files from.
pub struct WatcherConfig {
    pub dirs: Vec<WatchDirConfig>,
    pub stability_duration: Duration,
}

/// Sidecars are named after the input filename, not the ciphertext filename: strip the
/// `.enc` extension from the candidate path before appending `.key`.
fn key_sidecar_path(ciphertext_path: &Path) -> PathBuf {
    let mut name = ciphertext_path.with_extension("").into_os_string();
    name.push(".key");
    PathBuf::from(name)
}

/// Decrypt candidates must be `.enc` ciphertext files; without this, a `.key` sidecar
/// sitting in the same directory would itself be picked up and sent through decrypt.
fn is_decrypt_candidate(path: &Path) -> bool {
    path.extension().and_then(std::ffi::OsStr::to_str) == Some("enc")
}

fn dest_path_for(dir: &WatchDirConfig, source_path: &Path) -> PathBuf {
    let file_name = source_path.file_name().unwrap_or_default();
    let dest_name = match dir.operation {
        OperationKind::Encrypt => {
            let mut n = file_name.to_owned();
            n.push(".enc");
            n
        }
        OperationKind::Decrypt => file_name.to_owned(),
    };
    dir.dest_dir.join(dest_name)
}

/// Admit a single candidate path: run the stability gate, then (for decrypt) the
/// sidecar-race resolver, then build and enqueue a `WorkItem`.
#[instrument(level = "debug", skip(queue, dir), fields(operation = ?dir.operation))]
async fn admit_candidate(dir: &WatchDirConfig, path: &Path, queue: &WorkQueue, stability_duration: Duration) -> Result<(), WatchError> {
    if dir.operation == OperationKind::Decrypt && !is_decrypt_candidate(path) {
        return Ok(());
    }

    let Some(size) = scanner::wait_for_stable_size(path, stability_duration).await else {
        info!(path = %path.display(), "candidate disappeared before stabilizing, dropping");
        return Ok(());
    };

    let key_path = match dir.operation {
        OperationKind::Decrypt => {
            let sidecar = key_sidecar_path(path);
            if !scanner::wait_for_sidecar(&sidecar).await {
                warn!(path = %path.display(), "sidecar never appeared, discarding event");
                return Ok(());
            }
            Some(sidecar)
        }
        OperationKind::Encrypt => None,
    };

    let dest_path = dest_path_for(dir, path);
    let mut item = WorkItem::new(dir.operation, path.to_path_buf(), dest_path, size);
    item.key_path = key_path;

    match queue.enqueue(item) {
        Ok(()) => info!(path = %path.display(), "admitted candidate"),
        Err(e) => warn!(path = %path.display(), error = %e, "candidate already queued"),
    }
    Ok(())
}

/// Run the full startup scan across every configured directory, enqueueing every
/// admissible file so pre-existing files are never dropped.
#[instrument(level = "info", skip(config, queue))]
pub async fn startup_scan(config: &WatcherConfig, queue: &WorkQueue) {
    for dir in &config.dirs {
        let candidates = scanner::scan_dir(&dir.source_dir, dir.recursive);
        info!(dir = %dir.source_dir.display(), count = candidates.len(), "startup scan found candidates");
        for candidate in candidates {
            if let Err(e) = admit_candidate(dir, &candidate, queue, config.stability_duration).await {
                error!(path = %candidate.display(), error = %e, "startup scan admission failed");
            }
        }
    }
}

fn dir_for_event_path<'a>(dirs: &'a [WatchDirConfig], path: &Path) -> Option<&'a WatchDirConfig> {
    dirs.iter().find(|dir| path.starts_with(&dir.source_dir))
}

/// Run the live watcher loop until `cancel` fires. Re-reads `config` on every iteration
/// so a hot-reload (via `ArcSwap::store`) takes effect for subsequent events.
#[instrument(level = "info", skip_all)]
pub async fn run(
    config: Arc<ArcSwap<WatcherConfig>>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) -> Result<(), WatchError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;

    for dir in &config.load().dirs {
        watcher.watch(&dir.source_dir, recursive_mode(dir.recursive))?;
    }

    startup_scan(&config.load(), &queue).await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("watcher received cancellation, stopping subscription");
                return Ok(());
            }
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { return Ok(()) };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                let snapshot = config.load();
                for path in &event.paths {
                    if path.is_dir() {
                        continue;
                    }
                    let Some(dir) = dir_for_event_path(&snapshot.dirs, path) else { continue };
                    if let Err(e) = admit_candidate(dir, path, &queue, snapshot.stability_duration).await {
                        error!(path = %path.display(), error = %e, "event admission failed");
                    }
                }
            }
        }
    }
}

fn recursive_mode(recursive: bool) -> RecursiveMode {
    if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BackoffPolicy;

    fn test_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: Some(3),
        }
    }

    #[tokio::test]
    async fn admits_encrypt_candidate_without_sidecar_wait() {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = dir.path().join("in");
        let dest_dir = dir.path().join("out");
        tokio::fs::create_dir_all(&source_dir).await.unwrap();
        tokio::fs::create_dir_all(&dest_dir).await.unwrap();
        let file_path = source_dir.join("plain.txt");
        tokio::fs::write(&file_path, b"hello").await.unwrap();

        let watch_dir = WatchDirConfig {
            operation: OperationKind::Encrypt,
            source_dir,
            dest_dir,
            recursive: false,
        };
        let queue = WorkQueue::new(test_backoff());
        admit_candidate(&watch_dir, &file_path, &queue, scanner::DEFAULT_STABILITY_WINDOW).await.unwrap();

        assert_eq!(queue.size(), 1);
        let item = queue.list().remove(0);
        assert_eq!(item.operation, OperationKind::Encrypt);
        assert!(item.key_path.is_none());
    }

    #[tokio::test]
    async fn decrypt_candidate_waits_for_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = dir.path().join("in");
        let dest_dir = dir.path().join("out");
        tokio::fs::create_dir_all(&source_dir).await.unwrap();
        tokio::fs::create_dir_all(&dest_dir).await.unwrap();
        let file_path = source_dir.join("cipher.enc");
        tokio::fs::write(&file_path, b"ciphertext").await.unwrap();

        let sidecar_path = key_sidecar_path(&file_path);
        assert_eq!(sidecar_path, source_dir.join("cipher.key"));
        let sidecar_clone = sidecar_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tokio::fs::write(&sidecar_clone, b"vault:v1:abcd").await.unwrap();
        });

        let watch_dir = WatchDirConfig {
            operation: OperationKind::Decrypt,
            source_dir,
            dest_dir,
            recursive: false,
        };
        let queue = WorkQueue::new(test_backoff());
        admit_candidate(&watch_dir, &file_path, &queue, scanner::DEFAULT_STABILITY_WINDOW).await.unwrap();

        assert_eq!(queue.size(), 1);
        let item = queue.list().remove(0);
        assert_eq!(item.key_path, Some(sidecar_path));
    }

    #[tokio::test]
    async fn key_sidecar_in_decrypt_dir_is_not_itself_a_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = dir.path().join("in");
        let dest_dir = dir.path().join("out");
        tokio::fs::create_dir_all(&source_dir).await.unwrap();
        tokio::fs::create_dir_all(&dest_dir).await.unwrap();
        let sidecar_path = source_dir.join("cipher.key");
        tokio::fs::write(&sidecar_path, b"vault:v1:abcd").await.unwrap();

        let watch_dir = WatchDirConfig {
            operation: OperationKind::Decrypt,
            source_dir,
            dest_dir,
            recursive: false,
        };
        let queue = WorkQueue::new(test_backoff());
        admit_candidate(&watch_dir, &sidecar_path, &queue, scanner::DEFAULT_STABILITY_WINDOW).await.unwrap();

        assert_eq!(queue.size(), 0);
    }
}

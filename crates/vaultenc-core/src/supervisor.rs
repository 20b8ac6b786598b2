//! Wires the Watcher and Processor as long-lived tasks, owns the configuration
//! snapshot and the work queue, and reacts to reload/shutdown signals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::audit::{AuditError, AuditLog};
use crate::config::{Config, ConfigHandle};
use crate::kms::{KmsClient, KmsClientConfig, KmsError};
use crate::processor::{self, DecryptStrategy, EncryptStrategy, ProcessStrategy, SinkDirs};
use crate::queue::{BackoffPolicy, OperationKind, QueueError, WorkQueue};
use crate::watcher::{self, WatchDirConfig, WatchError, WatcherConfig};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Grace period the supervisor waits for in-flight work to quiesce after cancellation,
/// before persisting the queue snapshot and exiting.
const SHUTDOWN_QUIESCE: Duration = Duration::from_millis(100);

fn backoff_from(config: &Config) -> BackoffPolicy {
    BackoffPolicy {
        base_delay: config.queue.base_delay,
        max_delay: config.queue.max_delay,
        max_retries: config.queue.max_retries,
    }
}

fn watcher_config_from(config: &Config) -> WatcherConfig {
    WatcherConfig {
        dirs: vec![
            WatchDirConfig {
                operation: OperationKind::Encrypt,
                source_dir: config.encryption.source_dir.clone(),
                dest_dir: config.encryption.dest_dir.clone(),
                recursive: false,
            },
            WatchDirConfig {
                operation: OperationKind::Decrypt,
                source_dir: config.decryption.source_dir.clone(),
                dest_dir: config.decryption.dest_dir.clone(),
                recursive: false,
            },
        ],
        stability_duration: config.queue.stability_duration,
    }
}

fn strategies_from(config: &Config, kms: &Arc<KmsClient>, audit: &Arc<AuditLog>) -> HashMap<OperationKind, Arc<dyn ProcessStrategy>> {
    use crate::envelope::EnvelopeOptions;

    let mut strategies: HashMap<OperationKind, Arc<dyn ProcessStrategy>> = HashMap::new();

    let encrypt_options = EnvelopeOptions { chunk_size: config.encryption.chunk_size, ..Default::default() };
    strategies.insert(
        OperationKind::Encrypt,
        Arc::new(EncryptStrategy::new(
            Arc::clone(kms),
            SinkDirs::under(&config.encryption.source_dir),
            config.encryption.source_file_behavior,
            encrypt_options,
            config.encryption.calculate_checksum,
            Arc::clone(audit),
        )),
    );

    let decrypt_options = EnvelopeOptions { chunk_size: config.decryption.chunk_size, ..Default::default() };
    strategies.insert(
        OperationKind::Decrypt,
        Arc::new(DecryptStrategy::new(
            Arc::clone(kms),
            SinkDirs::under(&config.decryption.source_dir),
            config.decryption.source_file_behavior,
            decrypt_options,
            config.decryption.verify_checksum,
            Arc::clone(audit),
        )),
    );

    strategies
}

/// Owns one configuration snapshot, one work queue, and the watcher/processor tasks
/// built from it. `run` blocks until `cancel` fires (e.g. from a signal handler).
pub struct Supervisor {
    config: Arc<ConfigHandle>,
    queue: Arc<WorkQueue>,
}

impl Supervisor {
    pub fn new(config: Config, source_path: Option<std::path::PathBuf>) -> Result<Self, SupervisorError> {
        let queue = Arc::new(WorkQueue::new(backoff_from(&config)));
        if let Err(e) = queue.load(&config.queue.state_path) {
            error!(error = %e, "failed to load queue snapshot, starting empty");
        }
        Ok(Self {
            config: Arc::new(ConfigHandle::new(config, source_path)),
            queue,
        })
    }

    /// Run the watcher and processor tasks until `cancel` fires, then persist the queue
    /// and return.
    #[instrument(level = "info", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let config = self.config.load();

        let kms_config = KmsClientConfig {
            agent_address: config.vault.agent_address.clone(),
            transit_mount: config.vault.transit_mount.clone(),
            key_name: config.vault.key_name.clone(),
            request_timeout: config.vault.request_timeout,
            namespace: config.vault.namespace.clone(),
            token: std::env::var("VAULTENC_VAULT_TOKEN").ok(),
        };
        let kms = Arc::new(KmsClient::new(kms_config)?);
        let audit = Arc::new(AuditLog::open(config.logging.audit_path.as_deref().filter(|_| config.logging.audit_log))?);

        let watcher_config = Arc::new(ArcSwap::new(Arc::new(watcher_config_from(&config))));
        let strategies = strategies_from(&config, &kms, &audit);

        for strategy in strategies.values() {
            strategy.sinks().ensure_exist().await.ok();
        }

        let watcher_task = tokio::spawn(watcher::run(Arc::clone(&watcher_config), Arc::clone(&self.queue), cancel.clone()));
        let processor_task = tokio::spawn(processor::run(Arc::clone(&self.queue), strategies, Arc::clone(&audit), cancel.clone()));

        cancel.cancelled().await;
        info!("supervisor cancelled, waiting for tasks to quiesce");
        tokio::time::sleep(SHUTDOWN_QUIESCE).await;

        let _ = tokio::join!(watcher_task, processor_task);

        self.queue.save(&config.queue.state_path)?;
        info!("queue snapshot saved, supervisor exiting");
        Ok(())
    }

    /// Re-run the config load pipeline and publish a new snapshot if it validates.
    #[instrument(level = "info", skip(self))]
    pub fn reload(&self) {
        if let Err(e) = self.config.reload() {
            error!(error = %e, "configuration reload rejected, keeping previous snapshot");
        }
    }
}

/// Install the POSIX signal handlers (`SIGTERM`/`SIGINT` → shutdown, `SIGHUP` → reload)
/// and drive them against `supervisor` until shutdown. On non-Unix platforms only
/// `Ctrl+C` is wired; reload is unsupported and requires a process restart.
#[cfg(unix)]
pub async fn run_with_signals(supervisor: Arc<Supervisor>, cancel: CancellationToken) -> Result<(), SupervisorError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    let run_cancel = cancel.clone();
    let run_handle = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.run(run_cancel).await }
    });

    loop {
        tokio::select! {
            _ = sigterm.recv() => { info!("received SIGTERM"); cancel.cancel(); break; }
            _ = sigint.recv() => { info!("received SIGINT"); cancel.cancel(); break; }
            _ = sighup.recv() => { info!("received SIGHUP"); supervisor.reload(); }
            () = cancel.cancelled() => break,
        }
    }

    run_handle.await.expect("supervisor task panicked")
}

#[cfg(not(unix))]
pub async fn run_with_signals(supervisor: Arc<Supervisor>, cancel: CancellationToken) -> Result<(), SupervisorError> {
    let run_cancel = cancel.clone();
    let run_handle = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.run(run_cancel).await }
    });

    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl+C");
    cancel.cancel();

    run_handle.await.expect("supervisor task panicked")
}

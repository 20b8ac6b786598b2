//! Single-consumer loop: dequeue a work item, dispatch to an encrypt/decrypt strategy,
//! and apply the configured source-file disposition. No two operations touch the same
//! file concurrently, since there is exactly one consumer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::envelope::{self, EnvelopeError, EnvelopeOptions};
use crate::kms::{KmsClient, KmsError};
use crate::queue::{OperationKind, WorkItem, WorkQueue};
use crate::secure_buffer::SecureBuffer;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("source path {0} is not a plain file")]
    NotAPlainFile(PathBuf),
    #[error("work item is missing a required key sidecar path")]
    MissingKeySidecar,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error("checksum verification failed: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Whether this failure class should ever be retried. Integrity and format errors
    /// never are; transport/KMS-transient errors are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Kms(e) => e.is_retryable(),
            ProcessError::Envelope(EnvelopeError::Io { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFileBehavior {
    Archive,
    Delete,
    Keep,
}

/// Per-strategy sink directories, siblings of the watched source directory.
#[derive(Debug, Clone)]
pub struct SinkDirs {
    pub archive: PathBuf,
    pub failed: PathBuf,
    pub dlq: PathBuf,
}

impl SinkDirs {
    #[must_use]
    pub fn under(source_dir: &Path) -> Self {
        Self {
            archive: source_dir.join("archive"),
            failed: source_dir.join("failed"),
            dlq: source_dir.join("dlq"),
        }
    }

    pub async fn ensure_exist(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.archive).await?;
        tokio::fs::create_dir_all(&self.failed).await?;
        tokio::fs::create_dir_all(&self.dlq).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait ProcessStrategy: Send + Sync {
    async fn process(&self, item: &WorkItem) -> Result<(), ProcessError>;
    fn sinks(&self) -> &SinkDirs;
    fn source_behavior(&self) -> SourceFileBehavior;
}

async fn apply_source_behavior(source_path: &Path, sinks: &SinkDirs, behavior: SourceFileBehavior) -> Result<(), ProcessError> {
    match behavior {
        SourceFileBehavior::Keep => Ok(()),
        SourceFileBehavior::Delete => tokio::fs::remove_file(source_path)
            .await
            .map_err(|e| ProcessError::Io { operation: "delete source", source: e }),
        SourceFileBehavior::Archive => {
            let file_name = source_path.file_name().unwrap_or_default();
            let dest = sinks.archive.join(file_name);
            tokio::fs::rename(source_path, &dest)
                .await
                .map_err(|e| ProcessError::Io { operation: "archive source", source: e })
        }
    }
}

async fn write_checksum_sidecar(source_path: &Path, checksum: &str) -> Result<PathBuf, ProcessError> {
    let mut name = source_path.as_os_str().to_owned();
    name.push(".sha256");
    let path = PathBuf::from(name);
    tokio::fs::write(&path, checksum)
        .await
        .map_err(|e| ProcessError::Io { operation: "write checksum sidecar", source: e })?;
    Ok(path)
}

async fn sha256_hex(path: &Path) -> Result<String, ProcessError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ProcessError::Io { operation: "read for checksum", source: e })?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

pub struct EncryptStrategy {
    kms: Arc<KmsClient>,
    sinks: SinkDirs,
    behavior: SourceFileBehavior,
    envelope_options: EnvelopeOptions,
    calculate_checksum: bool,
    audit: Arc<AuditLog>,
}

impl EncryptStrategy {
    #[must_use]
    pub fn new(
        kms: Arc<KmsClient>,
        sinks: SinkDirs,
        behavior: SourceFileBehavior,
        envelope_options: EnvelopeOptions,
        calculate_checksum: bool,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self { kms, sinks, behavior, envelope_options, calculate_checksum, audit }
    }
}

#[async_trait::async_trait]
impl ProcessStrategy for EncryptStrategy {
    #[instrument(level = "info", skip(self, item), fields(id = %item.id))]
    async fn process(&self, item: &WorkItem) -> Result<(), ProcessError> {
        let metadata = tokio::fs::metadata(&item.source_path)
            .await
            .map_err(|e| ProcessError::Io { operation: "stat source", source: e })?;
        if !metadata.is_file() {
            return Err(ProcessError::NotAPlainFile(item.source_path.clone()));
        }

        let generated = self.kms.generate_data_key().await?;
        envelope::encrypt_file(&item.source_path, &item.dest_path, &generated.plaintext, &self.envelope_options).await?;

        let key_sidecar = key_sidecar_path_for(&item.source_path);
        write_wrapped_dek(&key_sidecar, &generated.wrapped).await?;

        if self.calculate_checksum {
            let checksum = sha256_hex(&item.source_path).await?;
            write_checksum_sidecar(&item.source_path, &checksum).await?;
        }

        apply_source_behavior(&item.source_path, &self.sinks, self.behavior).await?;
        self.audit.record(&AuditEvent::FileEncrypted { path: &item.source_path });
        info!(path = %item.source_path.display(), "encrypted");
        Ok(())
    }

    fn sinks(&self) -> &SinkDirs {
        &self.sinks
    }

    fn source_behavior(&self) -> SourceFileBehavior {
        self.behavior
    }
}

pub struct DecryptStrategy {
    kms: Arc<KmsClient>,
    sinks: SinkDirs,
    behavior: SourceFileBehavior,
    envelope_options: EnvelopeOptions,
    verify_checksum: bool,
    audit: Arc<AuditLog>,
}

impl DecryptStrategy {
    #[must_use]
    pub fn new(
        kms: Arc<KmsClient>,
        sinks: SinkDirs,
        behavior: SourceFileBehavior,
        envelope_options: EnvelopeOptions,
        verify_checksum: bool,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self { kms, sinks, behavior, envelope_options, verify_checksum, audit }
    }
}

#[async_trait::async_trait]
impl ProcessStrategy for DecryptStrategy {
    #[instrument(level = "info", skip(self, item), fields(id = %item.id))]
    async fn process(&self, item: &WorkItem) -> Result<(), ProcessError> {
        let key_path = item.key_path.as_ref().ok_or(ProcessError::MissingKeySidecar)?;
        let wrapped = tokio::fs::read_to_string(key_path)
            .await
            .map_err(|e| ProcessError::Io { operation: "read key sidecar", source: e })?;

        let dek = self.kms.decrypt_data_key(wrapped.trim()).await?;
        envelope::decrypt_file(&item.source_path, &item.dest_path, &dek, &self.envelope_options).await?;

        if self.verify_checksum {
            if let Some(checksum_path) = &item.checksum_path {
                let expected = tokio::fs::read_to_string(checksum_path)
                    .await
                    .map_err(|e| ProcessError::Io { operation: "read checksum sidecar", source: e })?;
                let actual = sha256_hex(&item.dest_path).await?;
                if expected.trim() != actual {
                    return Err(ProcessError::ChecksumMismatch { expected: expected.trim().to_string(), actual });
                }
            }
        }

        apply_source_behavior(&item.source_path, &self.sinks, self.behavior).await?;
        self.audit.record(&AuditEvent::FileDecrypted { path: &item.source_path });
        info!(path = %item.source_path.display(), "decrypted");
        Ok(())
    }

    fn sinks(&self) -> &SinkDirs {
        &self.sinks
    }

    fn source_behavior(&self) -> SourceFileBehavior {
        self.behavior
    }
}

fn key_sidecar_path_for(input_path: &Path) -> PathBuf {
    let mut name = input_path.as_os_str().to_owned();
    name.push(".key");
    PathBuf::from(name)
}

async fn write_wrapped_dek(path: &Path, wrapped: &str) -> Result<(), ProcessError> {
    tokio::fs::write(path, wrapped).await.map_err(|e| ProcessError::Io { operation: "write key sidecar", source: e })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
    }
    Ok(())
}

/// On terminal failure, move the source file into `failed/`; on DLQ promotion, move it
/// into `dlq/` instead. Never removes a file the processor has not taken ownership of.
async fn quarantine(source_path: &Path, sinks: &SinkDirs, to_dlq: bool) {
    let target_dir = if to_dlq { &sinks.dlq } else { &sinks.failed };
    let file_name = source_path.file_name().unwrap_or_default();
    let dest = target_dir.join(file_name);
    if let Err(e) = tokio::fs::rename(source_path, &dest).await {
        warn!(path = %source_path.display(), error = %e, "failed to quarantine source file");
    }
}

/// Run the processor loop until `cancel` fires. On cancellation, no new item is
/// dequeued; an in-flight item is not waited on, it is simply abandoned for the next
/// start to retry.
#[instrument(level = "info", skip_all)]
pub async fn run(
    queue: Arc<WorkQueue>,
    strategies: std::collections::HashMap<OperationKind, Arc<dyn ProcessStrategy>>,
    audit: Arc<AuditLog>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            info!("processor observed cancellation, stopping before next item");
            return;
        }

        let Some(item) = queue.dequeue() else {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(std::time::Duration::from_millis(100)) => continue,
            }
        };

        let Some(strategy) = strategies.get(&item.operation) else {
            error!(id = %item.id, "no strategy registered for operation, dropping item");
            continue;
        };

        match strategy.process(&item).await {
            Ok(()) => {}
            Err(e) if !e.is_retryable() => {
                error!(id = %item.id, error = %e, "non-retryable failure, quarantining");
                quarantine(&item.source_path, strategy.sinks(), false).await;
            }
            Err(e) => {
                warn!(id = %item.id, error = %e, "retryable failure, requeueing");
                let id = item.id.clone();
                let source_path = item.source_path.clone();
                let reason = e.to_string();
                queue.requeue(item, &reason);
                if queue.list().iter().any(|q| q.id == id && q.status == crate::queue::WorkStatus::DeadLetter) {
                    quarantine(&source_path, strategy.sinks(), true).await;
                    audit.record(&AuditEvent::DeadLettered { id: &id, path: &source_path, reason: &reason });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::kms::{KmsClient, KmsClientConfig};
    use crate::queue::WorkItem;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    async fn mock_kms(server: &MockServer, dek: &[u8]) -> Arc<KmsClient> {
        Mock::given(method("POST"))
            .and(path("/v1/transit/datakey/plaintext/vaultenc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "plaintext": b64(dek), "ciphertext": "vault:v1:wrapped-dek" }
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/transit/decrypt/vaultenc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "plaintext": b64(dek) }
            })))
            .mount(server)
            .await;

        Arc::new(
            KmsClient::new(KmsClientConfig {
                agent_address: server.uri(),
                transit_mount: "transit".to_string(),
                key_name: "vaultenc".to_string(),
                request_timeout: std::time::Duration::from_secs(5),
                namespace: None,
                token: None,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_strategy_round_trips_a_file() {
        let server = MockServer::start().await;
        let kms = mock_kms(&server, &[7u8; 32]).await;

        let dir = tempfile::tempdir().unwrap();
        let plaintext_path = dir.path().join("report.txt");
        tokio::fs::write(&plaintext_path, b"quarterly numbers").await.unwrap();

        let encrypted_path = dir.path().join("report.txt.enc");
        let encrypt_sinks = SinkDirs::under(dir.path());
        encrypt_sinks.ensure_exist().await.unwrap();
        let audit = Arc::new(AuditLog::disabled());
        let encrypt = EncryptStrategy::new(
            Arc::clone(&kms),
            encrypt_sinks.clone(),
            SourceFileBehavior::Keep,
            EnvelopeOptions::default(),
            false,
            Arc::clone(&audit),
        );

        let mut encrypt_item = WorkItem::new(OperationKind::Encrypt, plaintext_path.clone(), encrypted_path.clone(), 17);
        encrypt.process(&encrypt_item).await.unwrap();
        assert!(encrypted_path.exists());

        let decrypted_path = dir.path().join("report.txt.dec");
        let decrypt_sinks = SinkDirs::under(dir.path());
        let decrypt = DecryptStrategy::new(kms, decrypt_sinks, SourceFileBehavior::Keep, EnvelopeOptions::default(), false, audit);

        encrypt_item.key_path = Some(key_sidecar_path_for(&plaintext_path));
        let decrypt_item = WorkItem {
            source_path: encrypted_path,
            dest_path: decrypted_path.clone(),
            key_path: encrypt_item.key_path,
            ..encrypt_item
        };
        decrypt.process(&decrypt_item).await.unwrap();

        let roundtripped = tokio::fs::read(&decrypted_path).await.unwrap();
        assert_eq!(roundtripped, b"quarterly numbers");
    }

    #[tokio::test]
    async fn non_retryable_failure_is_quarantined_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let missing_source = dir.path().join("does-not-exist.txt");
        let sinks = SinkDirs::under(dir.path());
        sinks.ensure_exist().await.unwrap();

        let server = MockServer::start().await;
        let kms = mock_kms(&server, &[1u8; 32]).await;
        let audit = Arc::new(AuditLog::disabled());
        let strategy: Arc<dyn ProcessStrategy> = Arc::new(EncryptStrategy::new(
            kms,
            sinks,
            SourceFileBehavior::Archive,
            EnvelopeOptions::default(),
            false,
            audit,
        ));

        let item = WorkItem::new(OperationKind::Encrypt, missing_source, dir.path().join("out.enc"), 0);
        let err = strategy.process(&item).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use sha2::Digest;
use tracing::instrument;
use vaultenc_core::audit::{AuditEvent, AuditLog};
use vaultenc_core::envelope::{self, EnvelopeOptions};
use vaultenc_core::kms::{KmsClient, KmsClientConfig};

#[derive(Args)]
pub struct EncryptArgs {
    /// Path to the plaintext input file
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Path to write the encrypted output (default: `<input>.enc`)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Path to a config file providing the KMS connection
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Write a `<input>.sha256` checksum sidecar of the plaintext
    #[arg(long)]
    checksum: bool,

    /// Chunk size in bytes, clamped to [64 KiB, 10 MiB]
    #[arg(long)]
    chunk_size: Option<u32>,
}

#[instrument(level = "info", skip(args), fields(input = %args.input.display()))]
pub async fn run(args: EncryptArgs) -> Result<()> {
    let config = vaultenc_core::config::load(args.config.as_deref()).context("loading configuration")?;

    let kms_config = KmsClientConfig {
        agent_address: config.vault.agent_address.clone(),
        transit_mount: config.vault.transit_mount.clone(),
        key_name: config.vault.key_name.clone(),
        request_timeout: config.vault.request_timeout,
        namespace: config.vault.namespace.clone(),
        token: std::env::var("VAULTENC_VAULT_TOKEN").ok(),
    };
    let kms = KmsClient::new(kms_config).context("building KMS client")?;

    let output = args.output.unwrap_or_else(|| {
        let mut name = args.input.as_os_str().to_owned();
        name.push(".enc");
        PathBuf::from(name)
    });

    let generated = kms.generate_data_key().await.context("generating data key")?;

    let options = EnvelopeOptions {
        chunk_size: args.chunk_size.unwrap_or(config.encryption.chunk_size),
        ..Default::default()
    };
    envelope::encrypt_file(&args.input, &output, &generated.plaintext, &options)
        .await
        .context("encrypting file")?;

    let audit_path = config.logging.audit_path.as_deref().filter(|_| config.logging.audit_log);
    let audit = AuditLog::open(audit_path).context("opening audit log")?;
    audit.record(&AuditEvent::FileEncrypted { path: &args.input });

    let mut key_sidecar = args.input.as_os_str().to_owned();
    key_sidecar.push(".key");
    let key_sidecar = PathBuf::from(key_sidecar);
    tokio::fs::write(&key_sidecar, &generated.wrapped).await.context("writing key sidecar")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&key_sidecar, std::fs::Permissions::from_mode(0o600))
            .await
            .context("setting key sidecar permissions")?;
    }

    if args.checksum {
        let bytes = tokio::fs::read(&args.input).await.context("reading input for checksum")?;
        let digest = hex::encode(sha2::Sha256::digest(&bytes));
        let mut checksum_path = args.input.as_os_str().to_owned();
        checksum_path.push(".sha256");
        tokio::fs::write(PathBuf::from(checksum_path), digest).await.context("writing checksum sidecar")?;
    }

    println!("encrypted {} -> {}", args.input.display(), output.display());
    Ok(())
}

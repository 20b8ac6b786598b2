use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use sha2::Digest;
use tracing::instrument;
use vaultenc_core::audit::{AuditEvent, AuditLog};
use vaultenc_core::envelope::{self, EnvelopeOptions};
use vaultenc_core::kms::{KmsClient, KmsClientConfig};

#[derive(Args)]
pub struct DecryptArgs {
    /// Path to the ciphertext input file
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Path to the key sidecar (default: `<input>.key`)
    #[arg(short = 'k', long)]
    key_file: Option<PathBuf>,

    /// Path to write the decrypted output
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Path to a config file providing the KMS connection
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Verify the output against a `<input-without-.enc>.sha256` sidecar
    #[arg(long)]
    verify_checksum: bool,
}

#[instrument(level = "info", skip(args), fields(input = %args.input.display()))]
pub async fn run(args: DecryptArgs) -> Result<()> {
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

    let key_file = args.key_file.unwrap_or_else(|| {
        let mut name = args.input.with_extension("").into_os_string();
        name.push(".key");
        PathBuf::from(name)
    });
    let wrapped = tokio::fs::read_to_string(&key_file).await.context("reading key sidecar")?;

    let dek = kms.decrypt_data_key(wrapped.trim()).await.context("decrypting data key")?;

    let options = EnvelopeOptions::default();
    envelope::decrypt_file(&args.input, &args.output, &dek, &options)
        .await
        .context("decrypting file")?;

    let audit_path = config.logging.audit_path.as_deref().filter(|_| config.logging.audit_log);
    let audit = AuditLog::open(audit_path).context("opening audit log")?;
    audit.record(&AuditEvent::FileDecrypted { path: &args.input });

    if args.verify_checksum {
        let checksum_path = args.input.with_extension("");
        let checksum_path = PathBuf::from(format!("{}.sha256", checksum_path.display()));
        let expected = tokio::fs::read_to_string(&checksum_path).await.context("reading checksum sidecar")?;
        let bytes = tokio::fs::read(&args.output).await.context("reading output for checksum")?;
        let actual = hex::encode(sha2::Sha256::digest(&bytes));
        if expected.trim() != actual {
            bail!("checksum mismatch: expected {}, computed {actual}", expected.trim());
        }
    }

    println!("decrypted {} -> {}", args.input.display(), args.output.display());
    Ok(())
}

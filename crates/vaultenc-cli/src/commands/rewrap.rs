use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::instrument;
use vaultenc_core::audit::AuditLog;
use vaultenc_core::kms::{KmsClient, KmsClientConfig};
use vaultenc_core::rewrap::{self, OutputFormat, RewrapOptions, RewrapReport, RewrapTarget};

#[derive(Args)]
pub struct RewrapArgs {
    /// A single `.key` sidecar to rewrap
    #[arg(long, conflicts_with = "dir")]
    key_file: Option<PathBuf>,

    /// A directory of `.key` sidecars to rewrap
    #[arg(long, conflicts_with = "key_file")]
    dir: Option<PathBuf>,

    /// Recurse into subdirectories when `--dir` is given
    #[arg(long)]
    recursive: bool,

    /// Skip files already at or above this KMS key version
    #[arg(long, default_value_t = 1)]
    min_version: u32,

    /// Report what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Copy each `.key` file to `<path>.bak` before rewriting it
    #[arg(long)]
    backup: bool,

    /// Path to a config file providing the KMS connection
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Output format: text, json, or csv (case-insensitive)
    #[arg(long, default_value = "text")]
    format: String,
}

#[instrument(level = "info", skip(args))]
pub async fn run(args: RewrapArgs) -> Result<u8> {
    let format: OutputFormat = args.format.parse().map_err(anyhow::Error::msg)?;
    let target = RewrapTarget::resolve(args.key_file, args.dir, args.recursive)?;

    let config = vaultenc_core::config::load(args.config.as_deref()).context("loading configuration")?;
    let kms_config = KmsClientConfig {
        agent_address: config.vault.agent_address.clone(),
        transit_mount: config.vault.transit_mount.clone(),
        key_name: config.vault.key_name.clone(),
        request_timeout: config.vault.request_timeout,
        namespace: config.vault.namespace.clone(),
        token: std::env::var("VAULTENC_VAULT_TOKEN").ok(),
    };
    let kms = Arc::new(KmsClient::new(kms_config).context("building KMS client")?);
    let audit_path = config.logging.audit_path.as_deref().filter(|_| config.logging.audit_log);
    let audit = AuditLog::open(audit_path).context("opening audit log")?;

    let options = RewrapOptions {
        min_version: args.min_version,
        dry_run: args.dry_run,
        backup: args.backup,
    };
    let records = rewrap::rewrap(&target, &kms, &options, &audit).await.context("rewrapping keys")?;

    println!("{}", RewrapReport::new(&records).render(format));
    Ok(rewrap::exit_code_for(&records))
}

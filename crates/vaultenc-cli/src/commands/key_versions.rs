use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::instrument;
use vaultenc_core::rewrap::{exit_code_for, key_versions, OutputFormat, RewrapReport, RewrapTarget};

#[derive(Args)]
pub struct KeyVersionsArgs {
    /// A single `.key` sidecar to inspect
    #[arg(long, conflicts_with = "dir")]
    key_file: Option<PathBuf>,

    /// A directory of `.key` sidecars to inspect
    #[arg(long, conflicts_with = "key_file")]
    dir: Option<PathBuf>,

    /// Recurse into subdirectories when `--dir` is given
    #[arg(long)]
    recursive: bool,

    /// Output format: text, json, or csv (case-insensitive)
    #[arg(long, default_value = "text")]
    format: String,
}

/// Offline audit: never contacts the KMS, so this command stays synchronous.
#[instrument(level = "info", skip(args))]
pub fn run(args: KeyVersionsArgs) -> Result<u8> {
    let format: OutputFormat = args.format.parse().map_err(anyhow::Error::msg)?;
    let target = RewrapTarget::resolve(args.key_file, args.dir, args.recursive)?;

    let records = key_versions(&target);
    println!("{}", RewrapReport::new(&records).render(format));
    Ok(exit_code_for(&records))
}

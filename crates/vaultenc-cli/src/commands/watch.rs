use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use vaultenc_core::supervisor::{self, Supervisor};

#[derive(Args)]
pub struct WatchArgs {
    /// Path to the service configuration file
    #[arg(short = 'c', long)]
    config: PathBuf,
}

#[instrument(level = "info", skip(args))]
pub async fn run(args: WatchArgs, verbose: u8, quiet: bool) -> Result<()> {
    let config = vaultenc_core::config::load(Some(&args.config)).context("loading configuration")?;
    if !quiet {
        crate::logging::init_from_config(&config, verbose);
    }
    let supervisor = Arc::new(Supervisor::new(config, Some(args.config.clone())).context("starting supervisor")?);

    let cancel = CancellationToken::new();
    supervisor::run_with_signals(supervisor, cancel).await.context("running service")?;
    Ok(())
}

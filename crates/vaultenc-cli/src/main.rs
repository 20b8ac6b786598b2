#![deny(unsafe_code)]

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod exit_code;
mod logging;

use std::process::ExitCode;

use anyhow::Result;
use clap::{ColorChoice, Parser, Subcommand};
use vaultenc_core::config::ConfigError;
use vaultenc_core::envelope::EnvelopeError;
use vaultenc_core::kms::KmsError;
use vaultenc_core::processor::ProcessError;
use vaultenc_core::rewrap::RewrapError;

use crate::commands::{decrypt, encrypt, key_versions, rewrap, watch};

/// Envelope file encryption service: chunked AEAD backed by a Transit-style KMS.
#[derive(Parser)]
#[command(name = "vaultenc")]
#[command(author, version, propagate_version = true, color = ColorChoice::Auto)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// One-shot encrypt of a single file
    Encrypt(encrypt::EncryptArgs),
    /// One-shot decrypt of a single file
    Decrypt(decrypt::DecryptArgs),
    /// Run the watch/queue/process service
    Watch(watch::WatchArgs),
    /// Re-wrap `.key` sidecars to a newer KMS key version
    Rewrap(rewrap::RewrapArgs),
    /// Offline audit of `.key` sidecar versions
    KeyVersions(key_versions::KeyVersionsArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // `watch` derives its subscriber from the service config instead (text/JSON,
    // stderr/file); every other command gets plain verbosity-driven text.
    if !cli.quiet && !matches!(cli.command, Commands::Watch(_)) {
        logging::init(cli.verbose);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::from(exit_code::GENERAL_ERROR);
        }
    };

    match runtime.block_on(dispatch(cli.command, cli.verbose, cli.quiet)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = categorize_error(&e);
            if !cli.quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(code)
        }
    }
}

async fn dispatch(command: Commands, verbose: u8, quiet: bool) -> Result<u8> {
    match command {
        Commands::Encrypt(args) => encrypt::run(args).await.map(|()| exit_code::SUCCESS),
        Commands::Decrypt(args) => decrypt::run(args).await.map(|()| exit_code::SUCCESS),
        Commands::Watch(args) => watch::run(args, verbose, quiet).await.map(|()| exit_code::SUCCESS),
        Commands::Rewrap(args) => rewrap::run(args).await,
        Commands::KeyVersions(args) => key_versions::run(args),
    }
}

/// Categorize an error into an exit code using typed error downcasting rather than
/// string matching, so behavior does not depend on error message wording.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(env_err) = cause.downcast_ref::<EnvelopeError>() {
            match env_err {
                EnvelopeError::AuthenticationFailed { .. }
                | EnvelopeError::ChunkTooLarge { .. }
                | EnvelopeError::LengthExceeded { .. }
                | EnvelopeError::LengthMismatch { .. }
                | EnvelopeError::Header(_) => return exit_code::INTEGRITY_VIOLATION,
                EnvelopeError::Io { .. } => return exit_code::GENERAL_ERROR,
                _ => {}
            }
        }

        if let Some(kms_err) = cause.downcast_ref::<KmsError>() {
            match kms_err {
                KmsError::Unauthorized { .. } => return exit_code::KMS_UNAVAILABLE,
                KmsError::Transport(_) | KmsError::Throttled { .. } => return exit_code::KMS_UNAVAILABLE,
                _ => {}
            }
        }

        if let Some(process_err) = cause.downcast_ref::<ProcessError>() {
            match process_err {
                ProcessError::ChecksumMismatch { .. } => return exit_code::INTEGRITY_VIOLATION,
                ProcessError::Kms(e) if matches!(e, KmsError::Unauthorized { .. }) => return exit_code::KMS_UNAVAILABLE,
                _ => {}
            }
        }

        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::CONFIG_INVALID;
        }

        if let Some(rewrap_err) = cause.downcast_ref::<RewrapError>() {
            match rewrap_err {
                RewrapError::NoTarget | RewrapError::ConflictingTarget | RewrapError::InvalidMinVersion => {
                    return exit_code::CONFIG_INVALID;
                }
                RewrapError::ReadSidecar { .. } | RewrapError::WriteSidecar { .. } => return exit_code::NOT_FOUND,
                RewrapError::Kms(_) => return exit_code::KMS_UNAVAILABLE,
            }
        }
    }
    exit_code::GENERAL_ERROR
}

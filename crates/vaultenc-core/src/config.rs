//! Layered configuration: defaults, then an HCL/TOML file, then `VAULTENC_*` environment
//! overrides, validated and published as an RCU snapshot for hot-reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::processor::SourceFileBehavior;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("path {path} for {field} is not writable: {source}")]
    UnwritablePath {
        field: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    pub vault: Option<RawVaultConfig>,
    pub encryption: Option<RawDirectionConfig>,
    pub decryption: Option<RawDirectionConfig>,
    pub queue: Option<RawQueueConfig>,
    pub logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawVaultConfig {
    pub agent_address: Option<String>,
    pub transit_mount: Option<String>,
    pub key_name: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDirectionConfig {
    pub source_dir: Option<PathBuf>,
    pub dest_dir: Option<PathBuf>,
    pub source_file_behavior: Option<String>,
    pub chunk_size: Option<u32>,
    pub calculate_checksum: Option<bool>,
    pub verify_checksum: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawQueueConfig {
    pub state_path: Option<PathBuf>,
    pub max_retries: Option<i64>,
    pub base_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
    pub stability_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawLoggingConfig {
    pub level: Option<String>,
    pub output: Option<String>,
    pub format: Option<String>,
    pub audit_log: Option<bool>,
    pub audit_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub agent_address: String,
    pub transit_mount: String,
    pub key_name: String,
    pub request_timeout: Duration,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectionConfig {
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub source_file_behavior: SourceFileBehavior,
    pub chunk_size: u32,
    pub calculate_checksum: bool,
    pub verify_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub state_path: PathBuf,
    pub max_retries: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stability_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub output: Option<PathBuf>,
    pub format: LogFormat,
    pub audit_log: bool,
    pub audit_path: Option<PathBuf>,
}

/// Fully validated, immutable configuration. Published via `ArcSwap` for hot-reload.
#[derive(Debug, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    pub encryption: DirectionConfig,
    pub decryption: DirectionConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

fn parse_behavior(field: &'static str, raw: Option<String>, default: SourceFileBehavior) -> Result<SourceFileBehavior, ConfigError> {
    match raw {
        None => Ok(default),
        Some(s) => match s.as_str() {
            "archive" => Ok(SourceFileBehavior::Archive),
            "delete" => Ok(SourceFileBehavior::Delete),
            "keep" => Ok(SourceFileBehavior::Keep),
            other => Err(ConfigError::InvalidValue { field, value: other.to_string() }),
        },
    }
}

fn validate_writable(field: &'static str, dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::UnwritablePath {
        field,
        path: dir.to_path_buf(),
        source: e,
    })
}

impl Config {
    /// Merge `raw` over a set of hardcoded defaults, then validate the result.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let vault_raw = raw.vault.unwrap_or_default();
        let vault = VaultConfig {
            agent_address: vault_raw.agent_address.ok_or(ConfigError::MissingField("vault.agent_address"))?,
            transit_mount: vault_raw.transit_mount.unwrap_or_else(|| "transit".to_string()),
            key_name: vault_raw.key_name.ok_or(ConfigError::MissingField("vault.key_name"))?,
            request_timeout: Duration::from_secs(vault_raw.request_timeout_secs.unwrap_or(30)),
            namespace: vault_raw.namespace,
        };

        let enc_raw = raw.encryption.unwrap_or_default();
        let encryption = DirectionConfig {
            source_dir: enc_raw.source_dir.ok_or(ConfigError::MissingField("encryption.source_dir"))?,
            dest_dir: enc_raw.dest_dir.ok_or(ConfigError::MissingField("encryption.dest_dir"))?,
            source_file_behavior: parse_behavior("encryption.source_file_behavior", enc_raw.source_file_behavior, SourceFileBehavior::Archive)?,
            chunk_size: enc_raw.chunk_size.unwrap_or(crate::envelope::DEFAULT_CHUNK_SIZE),
            calculate_checksum: enc_raw.calculate_checksum.unwrap_or(false),
            verify_checksum: false,
        };

        let dec_raw = raw.decryption.unwrap_or_default();
        let decryption = DirectionConfig {
            source_dir: dec_raw.source_dir.ok_or(ConfigError::MissingField("decryption.source_dir"))?,
            dest_dir: dec_raw.dest_dir.ok_or(ConfigError::MissingField("decryption.dest_dir"))?,
            source_file_behavior: parse_behavior("decryption.source_file_behavior", dec_raw.source_file_behavior, SourceFileBehavior::Archive)?,
            chunk_size: dec_raw.chunk_size.unwrap_or(crate::envelope::DEFAULT_CHUNK_SIZE),
            calculate_checksum: false,
            verify_checksum: dec_raw.verify_checksum.unwrap_or(false),
        };

        let queue_raw = raw.queue.unwrap_or_default();
        let max_retries = match queue_raw.max_retries.unwrap_or(5) {
            -1 => None,
            n if n >= 0 => Some(n as u32),
            n => return Err(ConfigError::InvalidValue { field: "queue.max_retries", value: n.to_string() }),
        };
        let queue = QueueConfig {
            state_path: queue_raw.state_path.unwrap_or_else(|| PathBuf::from("vaultenc-queue.json")),
            max_retries,
            base_delay: Duration::from_secs(queue_raw.base_delay_secs.unwrap_or(1)),
            max_delay: Duration::from_secs(queue_raw.max_delay_secs.unwrap_or(300)),
            stability_duration: Duration::from_secs(queue_raw.stability_duration_secs.unwrap_or(1)),
        };

        let log_raw = raw.logging.unwrap_or_default();
        let level = match log_raw.level.as_deref().unwrap_or("info") {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "error" => LogLevel::Error,
            other => return Err(ConfigError::InvalidValue { field: "logging.level", value: other.to_string() }),
        };
        let format = match log_raw.format.as_deref().unwrap_or("text") {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(ConfigError::InvalidValue { field: "logging.format", value: other.to_string() }),
        };
        let logging = LoggingConfig {
            level,
            output: log_raw.output.map(PathBuf::from).filter(|p| p != Path::new("stderr")),
            format,
            audit_log: log_raw.audit_log.unwrap_or(false),
            audit_path: log_raw.audit_path,
        };

        validate_writable("encryption.dest_dir", &encryption.dest_dir)?;
        validate_writable("decryption.dest_dir", &decryption.dest_dir)?;
        if let Some(parent) = queue.state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            validate_writable("queue.state_path", parent)?;
        }

        Ok(Config { vault, encryption, decryption, queue, logging })
    }
}

/// Read `path`, overlay `VAULTENC_*` environment variables, and validate.
#[instrument(level = "info")]
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut raw = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile { path: path.to_path_buf(), source: e })?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })?
        }
        None => RawConfig::default(),
    };
    apply_env_overrides(&mut raw);
    Config::from_raw(raw)
}

fn apply_env_overrides(raw: &mut RawConfig) {
    if let Ok(value) = std::env::var("VAULTENC_VAULT_AGENT_ADDRESS") {
        raw.vault.get_or_insert_with(RawVaultConfig::default).agent_address = Some(value);
    }
    if let Ok(value) = std::env::var("VAULTENC_VAULT_KEY_NAME") {
        raw.vault.get_or_insert_with(RawVaultConfig::default).key_name = Some(value);
    }
    if let Ok(value) = std::env::var("VAULTENC_VAULT_TOKEN") {
        // The token is deliberately not part of `RawConfig`/`Config` — it is read directly
        // by the CLI boundary and passed to `KmsClientConfig` without ever being logged.
        drop(value);
    }
}

/// Wraps the current configuration snapshot for RCU-style reads and `SIGHUP` reloads.
pub struct ConfigHandle {
    inner: ArcSwap<Config>,
    source_path: Option<PathBuf>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(initial: Config, source_path: Option<PathBuf>) -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(initial)),
            source_path,
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Re-run the load pipeline and swap the snapshot. A reload that fails validation is
    /// rejected and the previous snapshot stays active.
    #[instrument(level = "info", skip(self))]
    pub fn reload(&self) -> Result<(), ConfigError> {
        let fresh = load(self.source_path.as_deref())?;
        self.inner.store(Arc::new(fresh));
        info!("configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw(source_dir: &Path, dest_dir: &Path, dec_source: &Path, dec_dest: &Path) -> RawConfig {
        RawConfig {
            vault: Some(RawVaultConfig {
                agent_address: Some("http://127.0.0.1:8200".to_string()),
                key_name: Some("vaultenc".to_string()),
                ..Default::default()
            }),
            encryption: Some(RawDirectionConfig {
                source_dir: Some(source_dir.to_path_buf()),
                dest_dir: Some(dest_dir.to_path_buf()),
                ..Default::default()
            }),
            decryption: Some(RawDirectionConfig {
                source_dir: Some(dec_source.to_path_buf()),
                dest_dir: Some(dec_dest.to_path_buf()),
                ..Default::default()
            }),
            queue: None,
            logging: None,
        }
    }

    #[test]
    fn rejects_missing_required_fields() {
        let result = Config::from_raw(RawConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingField("vault.agent_address"))));
    }

    #[test]
    fn applies_defaults_for_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let raw = minimal_raw(
            &dir.path().join("enc_in"),
            &dir.path().join("enc_out"),
            &dir.path().join("dec_in"),
            &dir.path().join("dec_out"),
        );
        let config = Config::from_raw(raw).unwrap();
        assert_eq!(config.vault.transit_mount, "transit");
        assert_eq!(config.queue.max_retries, Some(5));
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn max_retries_minus_one_means_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal_raw(
            &dir.path().join("enc_in"),
            &dir.path().join("enc_out"),
            &dir.path().join("dec_in"),
            &dir.path().join("dec_out"),
        );
        raw.queue = Some(RawQueueConfig { max_retries: Some(-1), ..Default::default() });
        let config = Config::from_raw(raw).unwrap();
        assert_eq!(config.queue.max_retries, None);
    }

    #[test]
    fn stability_duration_secs_is_parsed_into_queue_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal_raw(
            &dir.path().join("enc_in"),
            &dir.path().join("enc_out"),
            &dir.path().join("dec_in"),
            &dir.path().join("dec_out"),
        );
        raw.queue = Some(RawQueueConfig { stability_duration_secs: Some(5), ..Default::default() });
        let config = Config::from_raw(raw).unwrap();
        assert_eq!(config.queue.stability_duration, Duration::from_secs(5));
    }

    #[test]
    fn reload_keeps_previous_snapshot_on_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let raw = minimal_raw(
            &dir.path().join("enc_in"),
            &dir.path().join("enc_out"),
            &dir.path().join("dec_in"),
            &dir.path().join("dec_out"),
        );
        let initial = Config::from_raw(raw).unwrap();
        let handle = ConfigHandle::new(initial, Some(PathBuf::from("/nonexistent/vaultenc.toml")));

        let before = handle.load().vault.key_name.clone();
        assert!(handle.reload().is_err());
        assert_eq!(handle.load().vault.key_name, before);
    }
}

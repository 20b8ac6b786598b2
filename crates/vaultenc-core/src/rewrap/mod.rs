//! Key-rewrap engine: offline `.key` version audit and online re-wrap to a newer KMS
//! key version, with atomic file replacement and optional `.bak` backups.

mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::kms::{KmsClient, KmsError, WrappedDek};
use crate::watcher::scanner::scan_dir;

pub use report::{OutputFormat, RewrapReport};

#[derive(Debug, Error)]
pub enum RewrapError {
    #[error("neither --key-file nor --dir was given")]
    NoTarget,
    #[error("--key-file and --dir are mutually exclusive")]
    ConflictingTarget,
    #[error("--min-version must be >= 1")]
    InvalidMinVersion,
    #[error("failed to read key sidecar {path}: {source}")]
    ReadSidecar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write key sidecar {path}: {source}")]
    WriteSidecar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Kms(#[from] KmsError),
}

/// Resolves to either one explicit sidecar path or every `.key` file under a directory.
pub enum RewrapTarget {
    KeyFile(PathBuf),
    Dir { dir: PathBuf, recursive: bool },
}

impl RewrapTarget {
    pub fn resolve(key_file: Option<PathBuf>, dir: Option<PathBuf>, recursive: bool) -> Result<Self, RewrapError> {
        match (key_file, dir) {
            (Some(_), Some(_)) => Err(RewrapError::ConflictingTarget),
            (None, None) => Err(RewrapError::NoTarget),
            (Some(file), None) => Ok(RewrapTarget::KeyFile(file)),
            (None, Some(dir)) => Ok(RewrapTarget::Dir { dir, recursive }),
        }
    }

    fn key_files(&self) -> Vec<PathBuf> {
        match self {
            RewrapTarget::KeyFile(path) => vec![path.clone()],
            RewrapTarget::Dir { dir, recursive } => scan_dir(dir, *recursive)
                .into_iter()
                .filter(|p| p.extension().is_some_and(|ext| ext == "key"))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Rewrapped,
    WouldRewrap,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub file_path: PathBuf,
    pub old_version: u32,
    pub new_version: Option<u32>,
    pub status: RecordStatus,
    pub backup_created: bool,
    pub error: Option<String>,
}

/// Offline audit: parse every `.key` file's version, never contacting the KMS.
#[instrument(level = "info", skip(target))]
pub fn key_versions(target: &RewrapTarget) -> Vec<VersionRecord> {
    target
        .key_files()
        .into_iter()
        .map(|path| match read_wrapped(&path) {
            Ok(wrapped) => match WrappedDek::parse(wrapped.trim()) {
                Ok(parsed) => VersionRecord {
                    file_path: path,
                    old_version: parsed.version,
                    new_version: None,
                    status: RecordStatus::Skipped,
                    backup_created: false,
                    error: None,
                },
                Err(e) => VersionRecord {
                    file_path: path,
                    old_version: 0,
                    new_version: None,
                    status: RecordStatus::Failed,
                    backup_created: false,
                    error: Some(e.to_string()),
                },
            },
            Err(e) => VersionRecord {
                file_path: path,
                old_version: 0,
                new_version: None,
                status: RecordStatus::Failed,
                backup_created: false,
                error: Some(e.to_string()),
            },
        })
        .collect()
}

fn read_wrapped(path: &Path) -> Result<String, RewrapError> {
    std::fs::read_to_string(path).map_err(|e| RewrapError::ReadSidecar { path: path.to_path_buf(), source: e })
}

/// Options for an online rewrap pass.
pub struct RewrapOptions {
    pub min_version: u32,
    pub dry_run: bool,
    pub backup: bool,
}

/// Rewrap every `.key` file under `target` whose version is below `min_version`.
/// Atomic per-file: writes `<path>.tmp`, then renames over the original — the original
/// or the new content is always present in full, never a half-written file.
#[instrument(level = "info", skip(target, kms, options, audit))]
pub async fn rewrap(
    target: &RewrapTarget,
    kms: &Arc<KmsClient>,
    options: &RewrapOptions,
    audit: &AuditLog,
) -> Result<Vec<VersionRecord>, RewrapError> {
    if options.min_version == 0 {
        return Err(RewrapError::InvalidMinVersion);
    }

    let mut records = Vec::new();
    for path in target.key_files() {
        records.push(rewrap_one(&path, kms, options, audit).await);
    }
    Ok(records)
}

async fn rewrap_one(path: &Path, kms: &Arc<KmsClient>, options: &RewrapOptions, audit: &AuditLog) -> VersionRecord {
    let wrapped = match read_wrapped(path) {
        Ok(w) => w,
        Err(e) => {
            return VersionRecord {
                file_path: path.to_path_buf(),
                old_version: 0,
                new_version: None,
                status: RecordStatus::Failed,
                backup_created: false,
                error: Some(e.to_string()),
            }
        }
    };

    let parsed = match WrappedDek::parse(wrapped.trim()) {
        Ok(p) => p,
        Err(e) => {
            return VersionRecord {
                file_path: path.to_path_buf(),
                old_version: 0,
                new_version: None,
                status: RecordStatus::Failed,
                backup_created: false,
                error: Some(e.to_string()),
            }
        }
    };

    if parsed.version >= options.min_version {
        return VersionRecord {
            file_path: path.to_path_buf(),
            old_version: parsed.version,
            new_version: None,
            status: RecordStatus::Skipped,
            backup_created: false,
            error: None,
        };
    }

    if options.dry_run {
        return VersionRecord {
            file_path: path.to_path_buf(),
            old_version: parsed.version,
            new_version: None,
            status: RecordStatus::WouldRewrap,
            backup_created: false,
            error: None,
        };
    }

    let mut backup_created = false;
    if options.backup {
        let backup_path = path.with_extension("key.bak");
        if let Err(e) = std::fs::copy(path, &backup_path) {
            warn!(path = %path.display(), error = %e, "failed to write rewrap backup");
        } else {
            backup_created = true;
        }
    }

    match kms.rewrap_data_key(parsed.to_wire().as_str()).await {
        Ok(new_wrapped) => match atomic_replace(path, &new_wrapped) {
            Ok(()) => {
                let new_version = WrappedDek::parse(&new_wrapped).map(|p| p.version).unwrap_or(parsed.version);
                info!(path = %path.display(), old = parsed.version, new = new_version, "rewrapped key");
                audit.record(&AuditEvent::KeyRewrapped { path, old_version: parsed.version, new_version });
                VersionRecord {
                    file_path: path.to_path_buf(),
                    old_version: parsed.version,
                    new_version: Some(new_version),
                    status: RecordStatus::Rewrapped,
                    backup_created,
                    error: None,
                }
            }
            Err(e) => VersionRecord {
                file_path: path.to_path_buf(),
                old_version: parsed.version,
                new_version: None,
                status: RecordStatus::Failed,
                backup_created,
                error: Some(e.to_string()),
            },
        },
        Err(e) => VersionRecord {
            file_path: path.to_path_buf(),
            old_version: parsed.version,
            new_version: None,
            status: RecordStatus::Failed,
            backup_created,
            error: Some(e.to_string()),
        },
    }
}

fn atomic_replace(path: &Path, new_contents: &str) -> Result<(), RewrapError> {
    let tmp_path = path.with_extension("key.tmp");
    std::fs::write(&tmp_path, new_contents).map_err(|e| RewrapError::WriteSidecar { path: tmp_path.clone(), source: e })?;
    std::fs::rename(&tmp_path, path).map_err(|e| RewrapError::WriteSidecar { path: path.to_path_buf(), source: e })
}

/// Exit-code classification for the `rewrap` CLI command: `0` all good, `1` partial
/// failure, `2` total failure.
#[must_use]
pub fn exit_code_for(records: &[VersionRecord]) -> u8 {
    let total = records.len();
    let failed = records.iter().filter(|r| r.status == RecordStatus::Failed).count();
    if failed == 0 {
        0
    } else if failed < total {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_versions_audit_parses_each_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.key"), "vault:v1:aaaa").unwrap();
        std::fs::write(dir.path().join("b.key"), "vault:v2:bbbb").unwrap();

        let target = RewrapTarget::Dir { dir: dir.path().to_path_buf(), recursive: false };
        let mut records = key_versions(&target);
        records.sort_by_key(|r| r.old_version);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].old_version, 1);
        assert_eq!(records[1].old_version, 2);
    }

    #[test]
    fn exit_code_reflects_failure_ratio() {
        let ok = VersionRecord {
            file_path: PathBuf::from("a"),
            old_version: 1,
            new_version: Some(2),
            status: RecordStatus::Rewrapped,
            backup_created: false,
            error: None,
        };
        let mut failed = ok.clone_for_test();
        failed.status = RecordStatus::Failed;

        assert_eq!(exit_code_for(&[ok.clone_for_test()]), 0);
        assert_eq!(exit_code_for(&[ok.clone_for_test(), failed.clone_for_test()]), 1);
        assert_eq!(exit_code_for(&[failed]), 2);
    }

    impl VersionRecord {
        fn clone_for_test(&self) -> Self {
            VersionRecord {
                file_path: self.file_path.clone(),
                old_version: self.old_version,
                new_version: self.new_version,
                status: self.status,
                backup_created: self.backup_created,
                error: self.error.clone(),
            }
        }
    }

    #[test]
    fn target_resolution_rejects_conflicting_or_missing() {
        assert!(matches!(RewrapTarget::resolve(None, None, false), Err(RewrapError::NoTarget)));
        assert!(matches!(
            RewrapTarget::resolve(Some(PathBuf::from("a")), Some(PathBuf::from("b")), false),
            Err(RewrapError::ConflictingTarget)
        ));
    }
}

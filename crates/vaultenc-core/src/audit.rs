//! Append-only audit trail, independent of the `tracing` subscriber. Every line is a
//! self-contained JSON object; readers are not expected to follow the file in lockstep
//! with the regular log stream.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single security-relevant occurrence worth a permanent record, independent of the
/// transient log stream: a file moving through the envelope pipeline, or a `.key`
/// sidecar changing which KMS key version wraps it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent<'a> {
    FileEncrypted { path: &'a Path },
    FileDecrypted { path: &'a Path },
    DeadLettered { id: &'a str, path: &'a Path, reason: &'a str },
    KeyRewrapped { path: &'a Path, old_version: u32, new_version: u32 },
}

#[derive(Serialize)]
struct Record<'a> {
    #[serde(flatten)]
    event: &'a AuditEvent<'a>,
}

/// Guarded file appender for [`AuditEvent`]s. A disabled sink (`logging.audit_log =
/// false`) is a no-op `record` call, so call sites never need to branch on whether
/// auditing is turned on.
pub struct AuditLog {
    file: Option<Mutex<std::fs::File>>,
}

impl AuditLog {
    /// `path = None` produces a disabled sink whose `record` calls are no-ops.
    pub fn open(path: Option<&Path>) -> Result<Self, AuditError> {
        let file = match path {
            None => None,
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| AuditError::Open { path: path.to_path_buf(), source: e })?;
                Some(Mutex::new(file))
            }
        };
        Ok(Self { file })
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Write one JSON line. Failures are logged and swallowed: a broken audit sink must
    /// never interrupt the pipeline it is observing.
    pub fn record(&self, event: &AuditEvent<'_>) {
        let Some(file) = &self.file else { return };
        let record = Record { event };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        line.push('\n');

        match file.lock() {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()) {
                    warn!(error = %e, "failed to write audit event");
                }
            }
            Err(_) => warn!("audit log mutex poisoned, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_is_a_no_op() {
        let log = AuditLog::disabled();
        log.record(&AuditEvent::FileEncrypted { path: Path::new("/tmp/x") });
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(Some(&path)).unwrap();
        log.record(&AuditEvent::FileEncrypted { path: Path::new("/tmp/a.txt") });
        log.record(&AuditEvent::KeyRewrapped { path: Path::new("/tmp/a.txt.key"), old_version: 1, new_version: 2 });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event\":\"file_encrypted\""));
        assert!(lines[1].contains("\"new_version\":2"));
    }
}

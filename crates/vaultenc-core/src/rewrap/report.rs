//! Renders a set of `VersionRecord`s as text, JSON, or CSV.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::Serialize;

use super::{RecordStatus, VersionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unsupported output format '{other}', expected text|json|csv")),
        }
    }
}

impl RecordStatus {
    fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Rewrapped => "rewrapped",
            RecordStatus::WouldRewrap => "would_rewrap",
            RecordStatus::Skipped => "skipped",
            RecordStatus::Failed => "failed",
        }
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    file_path: String,
    old_version: u32,
    new_version: Option<u32>,
    status: &'a str,
    backup_created: bool,
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    total: usize,
    rewrapped: usize,
    would_rewrap: usize,
    skipped: usize,
    failed: usize,
    records: Vec<JsonRecord<'a>>,
}

pub struct RewrapReport<'a> {
    records: &'a [VersionRecord],
}

impl<'a> RewrapReport<'a> {
    #[must_use]
    pub fn new(records: &'a [VersionRecord]) -> Self {
        Self { records }
    }

    fn count(&self, status: RecordStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    #[must_use]
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
            OutputFormat::Csv => self.render_csv(),
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        for record in self.records {
            let _ = writeln!(
                out,
                "{}  v{} -> {}  [{}]{}",
                record.file_path.display(),
                record.old_version,
                record.new_version.map_or_else(|| "-".to_string(), |v| v.to_string()),
                record.status.as_str(),
                record.error.as_deref().map(|e| format!("  error: {e}")).unwrap_or_default(),
            );
        }
        let _ = writeln!(
            out,
            "\ntotal={} rewrapped={} would_rewrap={} skipped={} failed={}",
            self.records.len(),
            self.count(RecordStatus::Rewrapped),
            self.count(RecordStatus::WouldRewrap),
            self.count(RecordStatus::Skipped),
            self.count(RecordStatus::Failed),
        );
        out
    }

    fn render_json(&self) -> String {
        let report = JsonReport {
            total: self.records.len(),
            rewrapped: self.count(RecordStatus::Rewrapped),
            would_rewrap: self.count(RecordStatus::WouldRewrap),
            skipped: self.count(RecordStatus::Skipped),
            failed: self.count(RecordStatus::Failed),
            records: self
                .records
                .iter()
                .map(|r| JsonRecord {
                    file_path: r.file_path.display().to_string(),
                    old_version: r.old_version,
                    new_version: r.new_version,
                    status: r.status.as_str(),
                    backup_created: r.backup_created,
                    error: r.error.as_deref(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&report).unwrap_or_default()
    }

    fn render_csv(&self) -> String {
        let mut out = String::from("FilePath,OldVersion,NewVersion,Status,BackupCreated,Error\n");
        for record in self.records {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{}",
                csv_escape(&record.file_path.display().to_string()),
                record.old_version,
                record.new_version.map_or_else(String::new, |v| v.to_string()),
                record.status.as_str(),
                record.backup_created,
                csv_escape(record.error.as_deref().unwrap_or("")),
            );
        }
        out
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> Vec<VersionRecord> {
        vec![
            VersionRecord {
                file_path: PathBuf::from("a.key"),
                old_version: 1,
                new_version: Some(2),
                status: RecordStatus::Rewrapped,
                backup_created: true,
                error: None,
            },
            VersionRecord {
                file_path: PathBuf::from("b.key"),
                old_version: 2,
                new_version: None,
                status: RecordStatus::Skipped,
                backup_created: false,
                error: None,
            },
        ]
    }

    #[test]
    fn csv_header_matches_contract() {
        let records = sample();
        let rendered = RewrapReport::new(&records).render(OutputFormat::Csv);
        let header = rendered.lines().next().unwrap();
        assert_eq!(header, "FilePath,OldVersion,NewVersion,Status,BackupCreated,Error");
        assert_eq!(rendered.lines().count(), 1 + records.len());
    }

    #[test]
    fn json_report_round_trips_counts() {
        let records = sample();
        let rendered = RewrapReport::new(&records).render(OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["total"], 2);
        assert_eq!(parsed["rewrapped"], 1);
        assert_eq!(parsed["skipped"], 1);
    }

    #[test]
    fn parses_format_case_insensitively() {
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("Json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}

//! Daily-rotated append-only audit log.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::redact::{RedactionFilter, RedactionOutcome};
use crate::state::now_ts;

/// Appends redacted event records to one file per UTC day.
///
/// Single writer per process. Rotation is a pure function of the wall-clock
/// date; files are never rewritten once the day has passed.
pub struct AuditLogger {
    audit_dir: PathBuf,
    filter: RedactionFilter,
}

impl AuditLogger {
    pub fn new(audit_dir: impl Into<PathBuf>) -> Result<Self> {
        let audit_dir = audit_dir.into();
        std::fs::create_dir_all(&audit_dir)
            .with_context(|| format!("create audit dir: {}", audit_dir.display()))?;
        Ok(Self {
            audit_dir,
            filter: RedactionFilter::new(),
        })
    }

    pub fn audit_dir(&self) -> &Path {
        &self.audit_dir
    }

    /// Path of the log file for a given UTC date.
    pub fn daily_log_path(&self, date: NaiveDate) -> PathBuf {
        self.audit_dir
            .join(format!("audit-{}.jsonl", date.format("%Y%m%d")))
    }

    /// Append one event. Flushed before returning; no cross-call buffering.
    pub fn write(
        &self,
        event: &str,
        category: &str,
        fields: Map<String, Value>,
    ) -> Result<RedactionOutcome> {
        let now = Utc::now();
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::from(now_ts()));
        record.insert(
            "iso_ts".to_string(),
            Value::from(now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        record.insert("event".to_string(), Value::from(event));
        record.insert("category".to_string(), Value::from(category));
        for (k, v) in fields {
            record.insert(k, v);
        }

        let (redacted, outcome) = self.filter.apply(&record);

        let path = self.daily_log_path(now.date_naive());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log: {}", path.display()))?;
        writeln!(file, "{}", Value::Object(redacted))?;
        file.flush()?;
        Ok(outcome)
    }

    // Fixed-shape wrappers. They only pin the category and event name.

    pub fn write_order_event(&self, event: &str, fields: Map<String, Value>) -> Result<RedactionOutcome> {
        self.write(event, "order", fields)
    }

    pub fn write_fill_event(&self, event: &str, fields: Map<String, Value>) -> Result<RedactionOutcome> {
        self.write(event, "fill", fields)
    }

    pub fn write_config_event(&self, fields: Map<String, Value>) -> Result<RedactionOutcome> {
        self.write("ConfigChanged", "config", fields)
    }

    pub fn write_alert_event(&self, fields: Map<String, Value>) -> Result<RedactionOutcome> {
        self.write("AlertSent", "alert", fields)
    }

    pub fn write_auth_event(&self, event: &str, fields: Map<String, Value>) -> Result<RedactionOutcome> {
        self.write(event, "auth", fields)
    }
}

//! Daily regulatory evidence pack: orders, fills, compliance-relevant
//! audit events, and the active config snapshot, sealed by a manifest.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::audit::AuditLogger;
use crate::integrity::file_sha256;
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::snapshot::ConfigSnapshotter;
use crate::state::now_ts;
use crate::store::{FillRow, OrderRow, OrderStore};

/// Events worth exporting for compliance review.
const EXPORT_EVENTS: &[&str] = &[
    "AlertSent",
    "OrderAccepted",
    "PartiallyFilled",
    "Filled",
    "Rejected",
    "StopUpdated",
    "Login",
    "ConfigChanged",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub sha256: String,
    pub mtime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub created_at: u64,
    pub export_date: String,
    pub files: BTreeMap<String, ManifestEntry>,
    pub summary: ManifestSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub total_files: usize,
    pub total_size: u64,
}

#[derive(Debug)]
pub struct ExportResult {
    pub export_dir: PathBuf,
    pub manifest: ExportManifest,
    pub warnings: Vec<String>,
    pub removed_old_exports: usize,
}

pub struct AuditExporter<'a> {
    export_root: PathBuf,
    audit: &'a AuditLogger,
    store: Option<&'a dyn OrderStore>,
    snapshotter: Option<&'a ConfigSnapshotter>,
}

impl<'a> AuditExporter<'a> {
    pub fn new(
        export_root: impl Into<PathBuf>,
        audit: &'a AuditLogger,
        store: Option<&'a dyn OrderStore>,
        snapshotter: Option<&'a ConfigSnapshotter>,
    ) -> Self {
        Self {
            export_root: export_root.into(),
            audit,
            store,
            snapshotter,
        }
    }

    /// Assemble the pack for one UTC day. Every sub-export is optional;
    /// a missing source is a warning, never a failure. The directory is
    /// returned unconditionally, the manifest says what was captured.
    pub fn export_daily_audit_pack(
        &self,
        date: NaiveDate,
        retention_days: u32,
    ) -> Result<ExportResult> {
        let export_dir = self.export_root.join(date.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&export_dir)
            .with_context(|| format!("create export dir: {}", export_dir.display()))?;

        let mut warnings = Vec::new();

        // Pre-epoch dates clamp to zero instead of wrapping.
        let t0 = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp().max(0) as u64)
            .unwrap_or(0);
        let t1 = t0 + 86_400;

        match self.store {
            Some(store) => {
                if let Err(err) = self.export_orders(store, &export_dir, t0, t1) {
                    warnings.push(format!("orders export failed: {}", err));
                }
                if let Err(err) = self.export_fills(store, &export_dir, t0, t1) {
                    warnings.push(format!("fills export failed: {}", err));
                }
            }
            None => warnings.push("no order store available".to_string()),
        }

        if let Err(err) = self.export_alerts(date, &export_dir) {
            warnings.push(format!("audit log export failed: {}", err));
        }

        if let Err(err) = self.export_config_snapshot(&export_dir) {
            warnings.push(format!("config snapshot export failed: {}", err));
        }

        let manifest = build_manifest(&export_dir, date)?;
        std::fs::write(
            export_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        let removed = apply_retention(&self.export_root, retention_days);

        for warning in &warnings {
            logging::warn(Domain::Export, "sub_export_skipped", obj(&[("reason", v_str(warning))]));
        }
        logging::info(
            Domain::Export,
            "pack_created",
            obj(&[
                ("date", v_str(&date.to_string())),
                ("files", v_num(manifest.summary.total_files as f64)),
                ("bytes", v_num(manifest.summary.total_size as f64)),
                ("removed_old", v_num(removed as f64)),
            ]),
        );

        Ok(ExportResult {
            export_dir,
            manifest,
            warnings,
            removed_old_exports: removed,
        })
    }

    fn export_orders(&self, store: &dyn OrderStore, dir: &Path, t0: u64, t1: u64) -> Result<()> {
        let orders = store.orders_between(t0, t1)?;
        let mut out = String::from("ts,order_id,symbol,side,quantity,price,status,strategy\n");
        for o in &orders {
            out.push_str(&order_csv_line(o));
        }
        std::fs::write(dir.join("orders.csv"), out)?;
        Ok(())
    }

    fn export_fills(&self, store: &dyn OrderStore, dir: &Path, t0: u64, t1: u64) -> Result<()> {
        let fills = store.fills_between(t0, t1)?;
        let mut out = String::from("ts,fill_id,order_id,symbol,side,quantity,price,commission\n");
        for f in &fills {
            out.push_str(&fill_csv_line(f));
        }
        std::fs::write(dir.join("fills.csv"), out)?;
        Ok(())
    }

    /// Copy the day's audit lines whose event is on the export allow-list,
    /// preserving order.
    fn export_alerts(&self, date: NaiveDate, dir: &Path) -> Result<()> {
        let log_path = self.audit.daily_log_path(date);
        let file = std::fs::File::open(&log_path)
            .with_context(|| format!("no audit log for {}", date))?;
        let mut kept = String::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let keep = serde_json::from_str::<Value>(&line)
                .ok()
                .and_then(|v| v.get("event").and_then(Value::as_str).map(String::from))
                .map(|event| EXPORT_EVENTS.contains(&event.as_str()))
                .unwrap_or(false);
            if keep {
                kept.push_str(&line);
                kept.push('\n');
            }
        }
        std::fs::write(dir.join("alerts.jsonl"), kept)?;
        Ok(())
    }

    fn export_config_snapshot(&self, dir: &Path) -> Result<()> {
        let snapshotter = self
            .snapshotter
            .context("no config snapshotter available")?;
        let latest = snapshotter
            .get_latest_snapshot()
            .context("no config snapshot found")?;
        let snapshot = snapshotter.load_snapshot(&latest)?;
        std::fs::copy(
            snapshotter.snapshot_path(&latest),
            dir.join("config_snapshot.json"),
        )?;
        if !snapshot.diffs.is_empty() {
            let mut text = String::new();
            for (path, diff) in &snapshot.diffs {
                text.push_str(&format!("--- {}\n{}\n", path, diff));
            }
            std::fs::write(dir.join("config.diff"), text)?;
        }
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn order_csv_line(o: &OrderRow) -> String {
    format!(
        "{},{},{},{},{},{},{},{}\n",
        o.ts,
        csv_field(&o.order_id),
        csv_field(&o.symbol),
        csv_field(&o.side),
        o.quantity,
        o.price,
        csv_field(&o.status),
        csv_field(&o.strategy)
    )
}

fn fill_csv_line(f: &FillRow) -> String {
    format!(
        "{},{},{},{},{},{},{},{}\n",
        f.ts,
        csv_field(&f.fill_id),
        csv_field(&f.order_id),
        csv_field(&f.symbol),
        csv_field(&f.side),
        f.quantity,
        f.price,
        f.commission
    )
}

/// Hash every file already present in the export directory. The manifest
/// never lists itself.
fn build_manifest(dir: &Path, date: NaiveDate) -> Result<ExportManifest> {
    let mut files = BTreeMap::new();
    let mut total_size = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "manifest.json" {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        total_size += meta.len();
        files.insert(
            name,
            ManifestEntry {
                size: meta.len(),
                sha256: file_sha256(&path)?,
                mtime,
            },
        );
    }
    Ok(ExportManifest {
        created_at: now_ts(),
        export_date: date.to_string(),
        summary: ManifestSummary {
            total_files: files.len(),
            total_size,
        },
        files,
    })
}

/// Remove export subdirectories whose date-named folder is older than the
/// threshold. Unparseable names are left alone.
pub fn apply_retention(export_root: &Path, retention_days: u32) -> usize {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;
    let Ok(entries) = std::fs::read_dir(export_root) else {
        return 0;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(date) = NaiveDate::parse_from_str(&name, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff && std::fs::remove_dir_all(&path).is_ok() {
            logging::info(
                Domain::Export,
                "old_export_removed",
                obj(&[("dir", v_str(&name))]),
            );
            removed += 1;
        }
    }
    removed
}

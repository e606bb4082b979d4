//! Verified restore from a backup archive: fail-closed integrity checks,
//! pre-mutation safety copy, per-component validation, and optional
//! position reconciliation against the broker.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use walkdir::WalkDir;

use crate::archive;
use crate::backup::{verify_manifest_checksum, BackupManifest};
use crate::broker::Broker;
use crate::integrity::{sidecar_path, verify_sidecar};
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::state::Config;
use crate::store::{OrderStore, SqliteOrderStore};

const MANIFEST_NAME: &str = "BACKUP_MANIFEST.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Databases,
    Configs,
    Logs,
    Audit,
    State,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Databases,
        Component::Configs,
        Component::Logs,
        Component::Audit,
        Component::State,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Databases => "databases",
            Component::Configs => "configs",
            Component::Logs => "logs",
            Component::Audit => "audit",
            Component::State => "state",
        }
    }

    fn target_dir(&self, cfg: &Config) -> PathBuf {
        match self {
            Component::Databases => cfg.db_dir.clone(),
            Component::Configs => cfg.configs_dir.clone(),
            Component::Logs => cfg.logs_dir.clone(),
            Component::Audit => cfg.audit_dir.clone(),
            Component::State => cfg.state_dir.clone(),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "databases" | "db" => Ok(Component::Databases),
            "configs" | "config" => Ok(Component::Configs),
            "logs" => Ok(Component::Logs),
            "audit" => Ok(Component::Audit),
            "state" => Ok(Component::State),
            other => Err(anyhow!("unknown component: {}", other)),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ComponentRestore {
    pub restored: Vec<String>,
    pub failed: Vec<String>,
    /// Files that additionally passed their post-restore validation.
    pub verified: Vec<String>,
}

impl ComponentRestore {
    /// A component only counts as failed when nothing in it survived.
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty() || !self.restored.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub symbol: String,
    pub local: f64,
    pub broker: f64,
}

#[derive(Debug, Serialize)]
pub struct RestoreResult {
    pub success: bool,
    pub dry_run: bool,
    pub verified: Option<bool>,
    pub safety_copy: Option<PathBuf>,
    pub components: BTreeMap<String, ComponentRestore>,
    pub discrepancies: Vec<Discrepancy>,
    pub errors: Vec<String>,
    pub duration_secs: f64,
}

pub struct RestoreOptions {
    pub components: Vec<Component>,
    pub verify: bool,
    pub reconcile: bool,
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            components: Component::ALL.to_vec(),
            verify: true,
            reconcile: true,
            dry_run: false,
        }
    }
}

pub struct RestoreManager {
    cfg: Config,
}

impl RestoreManager {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub fn run_restore(
        &self,
        archive_path: &Path,
        opts: &RestoreOptions,
        broker: Option<&mut dyn Broker>,
    ) -> Result<RestoreResult> {
        let started = Instant::now();
        let mut result = RestoreResult {
            success: false,
            dry_run: opts.dry_run,
            verified: None,
            safety_copy: None,
            components: BTreeMap::new(),
            discrepancies: Vec::new(),
            errors: Vec::new(),
            duration_secs: 0.0,
        };

        // Fail-closed: any verification failure aborts before mutation.
        if opts.verify {
            match self.verify_archive(archive_path) {
                Ok(()) => result.verified = Some(true),
                Err(err) => {
                    result.verified = Some(false);
                    result.errors.push(err.to_string());
                    result.duration_secs = started.elapsed().as_secs_f64();
                    return Ok(result);
                }
            }
        }

        if opts.dry_run {
            // Report what would be restored without touching the tree.
            let entries = archive::list_entries(archive_path)?;
            for component in &opts.components {
                let prefix = format!("/{}/", component.as_str());
                let report = ComponentRestore {
                    restored: entries
                        .iter()
                        .filter(|e| e.contains(&prefix))
                        .cloned()
                        .collect(),
                    ..ComponentRestore::default()
                };
                result.components.insert(component.to_string(), report);
            }
            result.success = true;
            result.duration_secs = started.elapsed().as_secs_f64();
            return Ok(result);
        }

        // Rollback anchor: safety copy before any mutation. Abort on failure.
        let safety = match self.take_safety_copy() {
            Ok(path) => path,
            Err(err) => {
                result.errors.push(format!("safety copy failed: {}", err));
                result.duration_secs = started.elapsed().as_secs_f64();
                return Ok(result);
            }
        };
        result.safety_copy = Some(safety);

        let extract_dir = self
            .cfg
            .temp_restore_dir
            .join(Utc::now().format("%Y%m%d_%H%M%S").to_string());
        let outcome = self.extract_and_restore(archive_path, &extract_dir, opts, broker, &mut result);
        if extract_dir.exists() {
            let _ = std::fs::remove_dir_all(&extract_dir);
        }
        if let Err(err) = outcome {
            result.errors.push(err.to_string());
        }

        result.success = result.errors.is_empty()
            && result
                .components
                .values()
                .all(ComponentRestore::succeeded);
        result.duration_secs = started.elapsed().as_secs_f64();
        logging::info(
            Domain::Restore,
            "restore_finished",
            obj(&[
                ("success", serde_json::Value::Bool(result.success)),
                ("components", v_num(result.components.len() as f64)),
                ("discrepancies", v_num(result.discrepancies.len() as f64)),
            ]),
        );
        Ok(result)
    }

    /// Sidecar must match and the manifest must be inside the archive. A
    /// missing sidecar is tolerated with a warning; a present-but-wrong one
    /// is fatal.
    fn verify_archive(&self, archive_path: &Path) -> Result<()> {
        if sidecar_path(archive_path).exists() {
            verify_sidecar(archive_path)?;
        } else {
            logging::warn(
                Domain::Restore,
                "sidecar_missing",
                obj(&[("archive", v_str(&archive_path.display().to_string()))]),
            );
        }
        let entries = archive::list_entries(archive_path)?;
        if !entries.iter().any(|e| e.ends_with(MANIFEST_NAME)) {
            bail!("archive has no {}", MANIFEST_NAME);
        }
        Ok(())
    }

    fn take_safety_copy(&self) -> Result<PathBuf> {
        let dest = self
            .cfg
            .safety_dir
            .join(Utc::now().format("%Y%m%d_%H%M%S").to_string());
        std::fs::create_dir_all(&dest)?;
        copy_tree_if_present(&self.cfg.db_dir, &dest.join("databases"))?;
        copy_tree_if_present(&self.cfg.configs_dir, &dest.join("configs"))?;
        let state_dest = dest.join("state");
        std::fs::create_dir_all(&state_dest)?;
        for name in &self.cfg.critical_state_files {
            let src = self.cfg.state_dir.join(name);
            if src.is_file() {
                std::fs::copy(&src, state_dest.join(name))?;
            }
        }
        Ok(dest)
    }

    fn extract_and_restore(
        &self,
        archive_path: &Path,
        extract_dir: &Path,
        opts: &RestoreOptions,
        broker: Option<&mut dyn Broker>,
        result: &mut RestoreResult,
    ) -> Result<()> {
        archive::unpack(archive_path, extract_dir)?;
        let backup_root = find_backup_root(extract_dir)
            .context("extracted archive has no manifest-bearing root")?;
        let manifest: BackupManifest = serde_json::from_str(
            &std::fs::read_to_string(backup_root.join(MANIFEST_NAME))?,
        )?;
        if opts.verify && !verify_manifest_checksum(&manifest) {
            bail!("manifest self-checksum mismatch");
        }

        for component in &opts.components {
            let report = self.restore_component(*component, &backup_root, &manifest);
            result.components.insert(component.to_string(), report);
        }

        if opts.reconcile && opts.components.contains(&Component::Databases) {
            result.discrepancies = self.reconcile_positions(broker)?;
        }
        Ok(())
    }

    fn restore_component(
        &self,
        component: Component,
        backup_root: &Path,
        manifest: &BackupManifest,
    ) -> ComponentRestore {
        let mut report = ComponentRestore::default();
        let prefix = format!("{}/", component.as_str());
        let target_dir = component.target_dir(&self.cfg);
        if let Err(err) = std::fs::create_dir_all(&target_dir) {
            report.failed.push(format!("{}: {}", target_dir.display(), err));
            return report;
        }

        for rel in manifest.files.keys().filter(|k| k.starts_with(&prefix)) {
            let inner = &rel[prefix.len()..];
            let src = backup_root.join(rel);
            let dest = target_dir.join(inner);
            if !src.is_file() {
                report.failed.push(format!("{}: missing from archive", rel));
                continue;
            }
            let copied = dest
                .parent()
                .map(std::fs::create_dir_all)
                .transpose()
                .and_then(|_| std::fs::copy(&src, &dest));
            match copied {
                Ok(_) => {
                    report.restored.push(rel.clone());
                    match validate_restored(component, &dest) {
                        Ok(true) => report.verified.push(rel.clone()),
                        Ok(false) => {}
                        Err(err) => {
                            report.restored.pop();
                            report.failed.push(format!("{}: {}", rel, err));
                        }
                    }
                }
                Err(err) => report.failed.push(format!("{}: {}", rel, err)),
            }
        }
        report
    }

    /// Standalone reconciliation entry point. The drill runs this as its
    /// own phase after the restore phase skipped it.
    pub fn reconcile(&self, broker: Option<&mut dyn Broker>) -> Result<Vec<Discrepancy>> {
        self.reconcile_positions(broker)
    }

    /// Compare net positions in the restored order store against the live
    /// broker. No broker, or no order database, degrades to a no-op.
    fn reconcile_positions(
        &self,
        broker: Option<&mut dyn Broker>,
    ) -> Result<Vec<Discrepancy>> {
        let Some(broker) = broker else {
            return Ok(Vec::new());
        };
        let db_path = self.cfg.db_dir.join("orders.db");
        if !db_path.is_file() {
            return Ok(Vec::new());
        }
        if !broker.initialize() {
            logging::warn(Domain::Reconcile, "broker_unavailable", obj(&[]));
            return Ok(Vec::new());
        }

        let store = SqliteOrderStore::open(&db_path)?;
        let local = store.net_positions()?;
        let live: BTreeMap<String, f64> = broker
            .positions()
            .into_iter()
            .map(|p| (p.symbol, p.quantity))
            .collect();
        broker.shutdown();

        let mut discrepancies = Vec::new();
        let symbols: std::collections::BTreeSet<&String> =
            local.keys().chain(live.keys()).collect();
        for symbol in symbols {
            let l = local.get(symbol).copied().unwrap_or(0.0);
            let b = live.get(symbol).copied().unwrap_or(0.0);
            if (l - b).abs() > self.cfg.reconcile_tolerance {
                discrepancies.push(Discrepancy {
                    symbol: symbol.clone(),
                    local: l,
                    broker: b,
                });
            }
        }
        if !discrepancies.is_empty() {
            logging::warn(
                Domain::Reconcile,
                "position_discrepancies",
                obj(&[("count", v_num(discrepancies.len() as f64))]),
            );
        }
        Ok(discrepancies)
    }
}

fn copy_tree_if_present(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let rel = path.strip_prefix(src)?;
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(path, &target)?;
    }
    Ok(())
}

/// The extracted tree holds one `backup_<ts>/` directory with the manifest.
fn find_backup_root(extract_dir: &Path) -> Option<PathBuf> {
    if extract_dir.join(MANIFEST_NAME).is_file() {
        return Some(extract_dir.to_path_buf());
    }
    std::fs::read_dir(extract_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir() && p.join(MANIFEST_NAME).is_file())
}

/// Post-restore validation. Returns Ok(true) when a check ran and passed,
/// Ok(false) when the component has no check.
fn validate_restored(component: Component, path: &Path) -> Result<bool> {
    match component {
        Component::Databases => {
            let conn = Connection::open(path)?;
            let verdict: String =
                conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
            if verdict != "ok" {
                bail!("integrity_check: {}", verdict);
            }
            Ok(true)
        }
        Component::Configs => {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
                "json" => {
                    serde_json::from_str::<serde_json::Value>(&content)?;
                }
                "toml" => {
                    content.parse::<toml::Value>()?;
                }
                // Plain or unknown formats only need to be readable text.
                _ => {}
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

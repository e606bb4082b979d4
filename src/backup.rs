//! Full-system backup: hot database copies, config tree, recent logs,
//! audit trail, and state files, sealed into one checksummed archive.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::archive;
use crate::integrity::{file_sha256, sha256_hex, sidecar_path, write_sidecar, verify_sidecar};
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::state::{now_ts, Config};

const MANIFEST_NAME: &str = "BACKUP_MANIFEST.json";
const LOG_MAX_AGE_DAYS: u64 = 7;
const DB_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub file_count: usize,
    pub total_size: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIntegrity {
    pub manifest_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: u64,
    pub backup_id: String,
    pub full: bool,
    /// Relative path inside the backup root, e.g. `databases/orders.db`.
    pub files: BTreeMap<String, FileEntry>,
    pub components: BTreeMap<String, ComponentReport>,
    pub summary: BackupSummary,
    pub integrity: ManifestIntegrity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub total_files: usize,
    pub total_size: u64,
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub success: bool,
    pub backup_id: String,
    pub archive_path: Option<PathBuf>,
    pub archive_size: u64,
    pub duration_secs: f64,
    pub verified: Option<bool>,
    pub removed_old_backups: usize,
    pub components: BTreeMap<String, ComponentReport>,
    pub errors: Vec<String>,
}

pub struct BackupManager {
    cfg: Config,
}

impl BackupManager {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Run one backup. The staging directory is removed on every path out.
    pub fn run_backup(&self, full: bool, verify: bool) -> Result<BackupResult> {
        let started = Instant::now();
        let backup_id = format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        std::fs::create_dir_all(&self.cfg.backup_dir)
            .with_context(|| format!("create backup dir: {}", self.cfg.backup_dir.display()))?;
        let staging = self.cfg.backup_dir.join(format!("temp_{}", backup_id));

        let outcome = self.stage_and_pack(&backup_id, &staging, full, verify);
        if staging.exists() {
            let _ = std::fs::remove_dir_all(&staging);
        }

        let (archive_path, archive_size, verified, components, mut errors) = match outcome {
            Ok(v) => v,
            Err(err) => (None, 0, None, BTreeMap::new(), vec![err.to_string()]),
        };

        let removed = self.apply_retention();
        let success = archive_path.is_some() && errors.is_empty() && verified != Some(false);
        if verified == Some(false) {
            errors.push("archive verification failed".to_string());
        }

        let result = BackupResult {
            success,
            backup_id: backup_id.clone(),
            archive_path,
            archive_size,
            duration_secs: started.elapsed().as_secs_f64(),
            verified,
            removed_old_backups: removed,
            components,
            errors,
        };
        logging::info(
            Domain::Backup,
            "backup_finished",
            obj(&[
                ("backup_id", v_str(&backup_id)),
                ("success", serde_json::Value::Bool(result.success)),
                ("bytes", v_num(result.archive_size as f64)),
                ("removed_old", v_num(removed as f64)),
            ]),
        );
        Ok(result)
    }

    #[allow(clippy::type_complexity)]
    fn stage_and_pack(
        &self,
        backup_id: &str,
        staging: &Path,
        full: bool,
        verify: bool,
    ) -> Result<(
        Option<PathBuf>,
        u64,
        Option<bool>,
        BTreeMap<String, ComponentReport>,
        Vec<String>,
    )> {
        let root = staging.join(backup_id);
        std::fs::create_dir_all(&root)?;

        let mut files = BTreeMap::new();
        let mut components = BTreeMap::new();

        components.insert(
            "databases".to_string(),
            self.stage_databases(&root, &mut files),
        );
        // An incremental backup skips the slow-moving components.
        if full {
            components.insert(
                "configs".to_string(),
                stage_tree(&self.cfg.configs_dir, &root.join("configs"), "configs", &mut files),
            );
            components.insert("logs".to_string(), self.stage_logs(&root, &mut files));
        }
        components.insert(
            "audit".to_string(),
            stage_tree(&self.cfg.audit_dir, &root.join("audit"), "audit", &mut files),
        );
        components.insert("state".to_string(), self.stage_state(&root, &mut files));

        write_manifest(&root, backup_id, full, files, &components)?;

        let archive_path = self.cfg.backup_dir.join(format!("{}.tar.gz", backup_id));
        let archive_size = archive::pack_dir(&root, &archive_path)?;
        write_sidecar(&archive_path)?;

        let verified = if verify {
            Some(self.verify_archive(&archive_path, backup_id))
        } else {
            None
        };

        Ok((Some(archive_path), archive_size, verified, components, Vec::new()))
    }

    fn stage_databases(&self, root: &Path, files: &mut BTreeMap<String, FileEntry>) -> ComponentReport {
        let mut report = ComponentReport::default();
        let dest_dir = root.join("databases");
        if std::fs::create_dir_all(&dest_dir).is_err() {
            report.errors.push("cannot create databases staging dir".to_string());
            return report;
        }
        let Ok(entries) = std::fs::read_dir(&self.cfg.db_dir) else {
            return report;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let src = entry.path();
            let ext = src.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !src.is_file() || !DB_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let dest = dest_dir.join(&name);
            match hot_copy_db(&src, &dest).and_then(|_| record_file(&dest, &format!("databases/{}", name), files)) {
                Ok(size) => {
                    report.file_count += 1;
                    report.total_size += size;
                }
                Err(err) => report.errors.push(format!("{}: {}", name, err)),
            }
        }
        report
    }

    /// Logs younger than the age cap, non-recursive so the audit subtree
    /// stays in its own component.
    fn stage_logs(&self, root: &Path, files: &mut BTreeMap<String, FileEntry>) -> ComponentReport {
        let mut report = ComponentReport::default();
        let dest_dir = root.join("logs");
        if std::fs::create_dir_all(&dest_dir).is_err() {
            report.errors.push("cannot create logs staging dir".to_string());
            return report;
        }
        let Ok(entries) = std::fs::read_dir(&self.cfg.logs_dir) else {
            return report;
        };
        let max_age = Duration::from_secs(LOG_MAX_AGE_DAYS * 86_400);
        for entry in entries.filter_map(|e| e.ok()) {
            let src = entry.path();
            if !src.is_file() {
                continue;
            }
            let fresh = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok())
                .map(|age| age <= max_age)
                .unwrap_or(true);
            if !fresh {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let dest = dest_dir.join(&name);
            match std::fs::copy(&src, &dest)
                .map_err(anyhow::Error::from)
                .and_then(|_| record_file(&dest, &format!("logs/{}", name), files))
            {
                Ok(size) => {
                    report.file_count += 1;
                    report.total_size += size;
                }
                Err(err) => report.errors.push(format!("{}: {}", name, err)),
            }
        }
        report
    }

    fn stage_state(&self, root: &Path, files: &mut BTreeMap<String, FileEntry>) -> ComponentReport {
        let mut report = ComponentReport::default();
        let dest_dir = root.join("state");
        if std::fs::create_dir_all(&dest_dir).is_err() {
            report.errors.push("cannot create state staging dir".to_string());
            return report;
        }
        for name in &self.cfg.state_file_patterns {
            let src = self.cfg.state_dir.join(name);
            if !src.is_file() {
                continue;
            }
            let dest = dest_dir.join(name);
            match std::fs::copy(&src, &dest)
                .map_err(anyhow::Error::from)
                .and_then(|_| record_file(&dest, &format!("state/{}", name), files))
            {
                Ok(size) => {
                    report.file_count += 1;
                    report.total_size += size;
                }
                Err(err) => report.errors.push(format!("{}: {}", name, err)),
            }
        }
        report
    }

    fn verify_archive(&self, archive_path: &Path, backup_id: &str) -> bool {
        if verify_sidecar(archive_path).is_err() {
            return false;
        }
        let expected = format!("{}/{}", backup_id, MANIFEST_NAME);
        archive::list_entries(archive_path)
            .map(|entries| entries.iter().any(|e| e == &expected))
            .unwrap_or(false)
    }

    /// Delete archives (and sidecars) older than the retention window, by
    /// file modification time.
    pub fn apply_retention(&self) -> usize {
        let max_age = Duration::from_secs(self.cfg.backup_retention_days as u64 * 86_400);
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.cfg.backup_dir) else {
            return 0;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_file() || !name.starts_with("backup_") || !name.ends_with(".tar.gz") {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale && std::fs::remove_file(&path).is_ok() {
                let _ = std::fs::remove_file(sidecar_path(&path));
                logging::info(
                    Domain::Backup,
                    "old_backup_removed",
                    obj(&[("archive", v_str(&name))]),
                );
                removed += 1;
            }
        }
        removed
    }
}

/// Transactionally consistent copy via the SQLite online backup API.
fn hot_copy_db(src: &Path, dest: &Path) -> Result<()> {
    let src_conn = Connection::open_with_flags(src, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut dest_conn = Connection::open(dest)?;
    let backup = rusqlite::backup::Backup::new(&src_conn, &mut dest_conn)?;
    backup.run_to_completion(64, Duration::from_millis(50), None)?;
    Ok(())
}

fn record_file(path: &Path, rel: &str, files: &mut BTreeMap<String, FileEntry>) -> Result<u64> {
    let size = std::fs::metadata(path)?.len();
    files.insert(
        rel.to_string(),
        FileEntry {
            size,
            sha256: file_sha256(path)?,
        },
    );
    Ok(size)
}

/// Copy a directory tree into the staging area, recording every file.
fn stage_tree(
    src_root: &Path,
    dest_root: &Path,
    component: &str,
    files: &mut BTreeMap<String, FileEntry>,
) -> ComponentReport {
    let mut report = ComponentReport::default();
    if !src_root.is_dir() {
        return report;
    }
    for entry in WalkDir::new(src_root).into_iter().filter_map(|e| e.ok()) {
        let src = entry.path();
        if !src.is_file() {
            continue;
        }
        let Ok(rel) = src.strip_prefix(src_root) else {
            continue;
        };
        let dest = dest_root.join(rel);
        let rel_name = format!("{}/{}", component, rel.to_string_lossy());
        let copied = dest
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .map_err(anyhow::Error::from)
            .and_then(|_| std::fs::copy(src, &dest).map_err(anyhow::Error::from))
            .and_then(|_| record_file(&dest, &rel_name, files));
        match copied {
            Ok(size) => {
                report.file_count += 1;
                report.total_size += size;
            }
            Err(err) => report.errors.push(format!("{}: {}", rel_name, err)),
        }
    }
    report
}

/// Two-pass manifest write: serialize with an empty checksum, hash those
/// bytes, rewrite once with the checksum embedded.
fn write_manifest(
    root: &Path,
    backup_id: &str,
    full: bool,
    files: BTreeMap<String, FileEntry>,
    components: &BTreeMap<String, ComponentReport>,
) -> Result<()> {
    let mut manifest = BackupManifest {
        created_at: now_ts(),
        backup_id: backup_id.to_string(),
        full,
        summary: BackupSummary {
            total_files: files.len(),
            total_size: files.values().map(|f| f.size).sum(),
        },
        files,
        components: components.clone(),
        integrity: ManifestIntegrity {
            manifest_checksum: String::new(),
        },
    };
    let first_pass = serde_json::to_string_pretty(&manifest)?;
    manifest.integrity.manifest_checksum = sha256_hex(first_pass.as_bytes());
    std::fs::write(
        root.join(MANIFEST_NAME),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    Ok(())
}

/// Recompute the manifest's self-checksum and compare. Used by restore.
pub fn verify_manifest_checksum(manifest: &BackupManifest) -> bool {
    let mut blank = manifest.clone();
    blank.integrity.manifest_checksum = String::new();
    match serde_json::to_string_pretty(&blank) {
        Ok(text) => sha256_hex(text.as_bytes()) == manifest.integrity.manifest_checksum,
        Err(_) => false,
    }
}

//! Runtime configuration for the resilience tooling.
//!
//! Everything is env-driven with sane defaults so the binaries run
//! unconfigured against a local deployment layout.

use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the live SQLite databases.
    pub db_dir: PathBuf,
    /// Single config root used by backup and restore.
    pub configs_dir: PathBuf,
    /// Directory holding operational state files (positions, open orders).
    pub state_dir: PathBuf,
    /// Directories scanned by the config snapshotter.
    pub config_dirs: Vec<PathBuf>,
    pub logs_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub export_dir: PathBuf,
    /// Where pre-restore safety copies land.
    pub safety_dir: PathBuf,
    pub temp_restore_dir: PathBuf,
    /// Where the drill's failure-simulation phase moves files aside.
    pub failure_backup_dir: PathBuf,
    /// Glob-free filename patterns for operational state files.
    pub state_file_patterns: Vec<String>,
    /// State files whose absence fails a restore.
    pub critical_state_files: Vec<String>,
    pub backup_retention_days: u32,
    pub export_retention_days: u32,
    pub reconcile_tolerance: f64,
    pub command_timeout_secs: u64,
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).unwrap_or_else(|_| default.to_string()).into()
}

impl Config {
    pub fn from_env() -> Self {
        let root = std::env::var("OPS_ROOT").unwrap_or_else(|_| ".".to_string());
        let base = Self::rooted(Path::new(&root));
        Self {
            db_dir: env_path("DB_DIR", &base.db_dir.to_string_lossy()),
            configs_dir: env_path("CONFIGS_DIR", &base.configs_dir.to_string_lossy()),
            state_dir: env_path("STATE_DIR", &base.state_dir.to_string_lossy()),
            config_dirs: std::env::var("CONFIG_DIRS")
                .map(|v| v.split(',').map(|p| PathBuf::from(p.trim())).collect())
                .unwrap_or(base.config_dirs),
            logs_dir: env_path("LOGS_DIR", &base.logs_dir.to_string_lossy()),
            audit_dir: env_path("AUDIT_DIR", &base.audit_dir.to_string_lossy()),
            snapshot_dir: env_path("SNAPSHOT_DIR", &base.snapshot_dir.to_string_lossy()),
            backup_dir: env_path("BACKUP_DIR", &base.backup_dir.to_string_lossy()),
            export_dir: env_path("EXPORT_DIR", &base.export_dir.to_string_lossy()),
            safety_dir: env_path("SAFETY_DIR", &base.safety_dir.to_string_lossy()),
            temp_restore_dir: env_path("TEMP_RESTORE_DIR", &base.temp_restore_dir.to_string_lossy()),
            failure_backup_dir: env_path(
                "FAILURE_BACKUP_DIR",
                &base.failure_backup_dir.to_string_lossy(),
            ),
            state_file_patterns: base.state_file_patterns,
            critical_state_files: base.critical_state_files,
            backup_retention_days: std::env::var("BACKUP_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            export_retention_days: std::env::var("EXPORT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            reconcile_tolerance: std::env::var("RECONCILE_TOLERANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.01),
            command_timeout_secs: std::env::var("COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    /// Layout rooted at an arbitrary directory. Used by tests and the drill.
    pub fn rooted(root: &Path) -> Self {
        Self {
            db_dir: root.join("data"),
            configs_dir: root.join("configs"),
            state_dir: root.join("state"),
            config_dirs: vec![root.join("configs"), root.to_path_buf()],
            logs_dir: root.join("logs"),
            audit_dir: root.join("logs/audit"),
            snapshot_dir: root.join("logs/audit/config_snapshots"),
            backup_dir: root.join("backups"),
            export_dir: root.join("exports/audit"),
            safety_dir: root.join("backup_original"),
            temp_restore_dir: root.join("temp_restore"),
            failure_backup_dir: root.join("drill_failure_backup"),
            state_file_patterns: vec![
                "positions.json".to_string(),
                "open_orders.json".to_string(),
                "risk_state.json".to_string(),
                "session_state.json".to_string(),
            ],
            critical_state_files: vec!["positions.json".to_string()],
            backup_retention_days: 30,
            export_retention_days: 90,
            reconcile_tolerance: 0.01,
            command_timeout_secs: 10,
        }
    }
}

/// Unix timestamp in seconds.
pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_layout_is_under_root() {
        let cfg = Config::rooted(Path::new("/srv/trader"));
        assert!(cfg.db_dir.starts_with("/srv/trader"));
        assert!(cfg.backup_dir.starts_with("/srv/trader"));
        assert!(cfg.audit_dir.starts_with(&cfg.logs_dir));
        assert!(cfg.snapshot_dir.starts_with(&cfg.audit_dir));
    }

    #[test]
    fn test_rooted_defaults() {
        let cfg = Config::rooted(Path::new("/tmp/x"));
        assert_eq!(cfg.backup_retention_days, 30);
        assert_eq!(cfg.export_retention_days, 90);
        assert!((cfg.reconcile_tolerance - 0.01).abs() < 1e-12);
        assert!(cfg
            .critical_state_files
            .iter()
            .all(|f| cfg.state_file_patterns.contains(f)));
    }
}

//! Disaster-recovery drill: backup, simulated failure, restore, health
//! checks, broker reconnect, reconciliation, smoke tests. Sequential,
//! single-threaded, with per-phase timing and a go/no-go verdict.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::backup::BackupManager;
use crate::broker::Broker;
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::restore::{Component, RestoreManager, RestoreOptions};
use crate::state::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BackupCreation,
    FailureSimulation,
    SystemRestore,
    HealthVerification,
    BrokerReconnection,
    PositionReconciliation,
    SmokeTests,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BackupCreation => "backup_creation",
            Phase::FailureSimulation => "failure_simulation",
            Phase::SystemRestore => "system_restore",
            Phase::HealthVerification => "health_verification",
            Phase::BrokerReconnection => "broker_reconnection",
            Phase::PositionReconciliation => "position_reconciliation",
            Phase::SmokeTests => "smoke_tests",
        }
    }
}

/// Execution order and criticality. A critical failure aborts the drill,
/// a non-critical one only annotates it.
pub const PHASE_TABLE: &[(Phase, bool)] = &[
    (Phase::BackupCreation, true),
    (Phase::FailureSimulation, true),
    (Phase::SystemRestore, true),
    (Phase::HealthVerification, true),
    (Phase::BrokerReconnection, false),
    (Phase::PositionReconciliation, false),
    (Phase::SmokeTests, true),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    pub name: &'static str,
    pub status: PhaseStatus,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub details: Value,
}

#[derive(Debug, Serialize)]
pub struct DrillMetrics {
    pub total_phases: usize,
    pub completed_phases: usize,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct DrillReport {
    pub drill_id: String,
    pub start_time: String,
    pub end_time: String,
    pub dry_run: bool,
    pub phases: Vec<PhaseResult>,
    pub metrics: DrillMetrics,
    pub success: bool,
    pub errors: Vec<String>,
}

pub struct DrillOrchestrator {
    cfg: Config,
    broker: Box<dyn Broker>,
    backup_artifact: Option<PathBuf>,
}

impl DrillOrchestrator {
    pub fn new(cfg: Config, broker: Box<dyn Broker>) -> Self {
        Self {
            cfg,
            broker,
            backup_artifact: None,
        }
    }

    pub fn run(&mut self, dry_run: bool) -> Result<DrillReport> {
        let drill_id = format!("drill_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let start_time = now_iso();
        let mut phases = Vec::new();
        let mut errors = Vec::new();

        logging::info(
            Domain::Drill,
            "drill_started",
            obj(&[
                ("drill_id", v_str(&drill_id)),
                ("dry_run", Value::Bool(dry_run)),
            ]),
        );

        for (phase, critical) in PHASE_TABLE {
            let started = Instant::now();
            let phase_start = now_iso();
            let outcome = self.run_phase(*phase, dry_run);
            let (status, details) = match outcome {
                Ok(details) => (PhaseStatus::Success, details),
                Err(err) => (PhaseStatus::Failed, json!({ "error": err.to_string() })),
            };
            let failed = status == PhaseStatus::Failed;
            phases.push(PhaseResult {
                name: phase.as_str(),
                status,
                start_time: phase_start,
                end_time: now_iso(),
                duration_secs: started.elapsed().as_secs_f64(),
                details,
            });
            logging::info(
                Domain::Drill,
                "phase_finished",
                obj(&[
                    ("phase", v_str(phase.as_str())),
                    ("failed", Value::Bool(failed)),
                    ("duration_secs", v_num(started.elapsed().as_secs_f64())),
                ]),
            );
            if failed && *critical {
                errors.push(format!("critical phase {} failed", phase.as_str()));
                break;
            }
        }

        self.cleanup(dry_run);

        let completed = phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Success)
            .count();
        let report = DrillReport {
            drill_id,
            start_time,
            end_time: now_iso(),
            dry_run,
            metrics: DrillMetrics {
                total_phases: PHASE_TABLE.len(),
                completed_phases: completed,
                success_rate: completed as f64 / PHASE_TABLE.len() as f64,
            },
            success: errors.is_empty(),
            phases,
            errors,
        };
        logging::info(
            Domain::Drill,
            "drill_finished",
            obj(&[
                ("drill_id", v_str(&report.drill_id)),
                ("success", Value::Bool(report.success)),
                ("completed", v_num(completed as f64)),
            ]),
        );
        Ok(report)
    }

    fn run_phase(&mut self, phase: Phase, dry_run: bool) -> Result<Value> {
        match phase {
            Phase::BackupCreation => self.phase_backup(dry_run),
            Phase::FailureSimulation => self.phase_failure_simulation(dry_run),
            Phase::SystemRestore => self.phase_restore(dry_run),
            Phase::HealthVerification => self.phase_health(),
            Phase::BrokerReconnection => self.phase_broker(dry_run),
            Phase::PositionReconciliation => self.phase_reconcile(dry_run),
            Phase::SmokeTests => phase_smoke_tests(),
        }
    }

    fn phase_backup(&mut self, dry_run: bool) -> Result<Value> {
        if dry_run {
            return Ok(json!({ "mocked": true, "would": "run full verified backup" }));
        }
        let result = BackupManager::new(self.cfg.clone()).run_backup(true, true)?;
        if !result.success {
            anyhow::bail!("backup failed: {:?}", result.errors);
        }
        self.backup_artifact = result.archive_path.clone();
        Ok(json!({
            "archive": result.archive_path.map(|p| p.display().to_string()),
            "bytes": result.archive_size,
            "verified": result.verified,
        }))
    }

    /// Copy critical files aside, then damage the originals in place so the
    /// restore phase has real failure to recover from.
    fn phase_failure_simulation(&mut self, dry_run: bool) -> Result<Value> {
        if dry_run {
            return Ok(json!({
                "mocked": true,
                "would": "corrupt databases and state files in place",
            }));
        }
        let stash = self
            .cfg
            .failure_backup_dir
            .join(Utc::now().format("%Y%m%d_%H%M%S").to_string());
        std::fs::create_dir_all(&stash)?;

        let mut damaged = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.cfg.db_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_file() {
                    std::fs::copy(&path, stash.join(entry.file_name()))?;
                    // Truncation leaves a structurally broken database.
                    std::fs::write(&path, b"corrupted")?;
                    damaged.push(path.display().to_string());
                }
            }
        }
        for (i, name) in self.cfg.state_file_patterns.iter().enumerate() {
            let path = self.cfg.state_dir.join(name);
            if !path.is_file() {
                continue;
            }
            std::fs::copy(&path, stash.join(name))?;
            if i % 2 == 0 {
                std::fs::write(&path, b"{ not valid json")?;
            } else {
                std::fs::remove_file(&path)?;
            }
            damaged.push(path.display().to_string());
        }
        Ok(json!({ "damaged": damaged, "stash": stash.display().to_string() }))
    }

    fn phase_restore(&mut self, dry_run: bool) -> Result<Value> {
        if dry_run {
            return Ok(json!({ "mocked": true, "would": "restore all components" }));
        }
        let archive = self
            .backup_artifact
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no backup artifact from backup phase"))?;
        let opts = RestoreOptions {
            components: Component::ALL.to_vec(),
            verify: true,
            // Reconciliation gets its own phase.
            reconcile: false,
            dry_run: false,
        };
        let result = RestoreManager::new(self.cfg.clone()).run_restore(&archive, &opts, None)?;
        if !result.success {
            anyhow::bail!("restore failed: {:?}", result.errors);
        }
        Ok(json!({
            "components": result.components.len(),
            "safety_copy": result.safety_copy.map(|p| p.display().to_string()),
        }))
    }

    /// Four independent read-only checks, all required.
    fn phase_health(&self) -> Result<Value> {
        let db_ok = check_databases(&self.cfg.db_dir);
        let config_ok = check_configs(&self.cfg.configs_dir);
        let audit_ok = self.cfg.audit_dir.is_dir();
        let state_ok = self
            .cfg
            .critical_state_files
            .iter()
            .all(|name| self.cfg.state_dir.join(name).is_file());

        let details = json!({
            "databases": db_ok,
            "configs": config_ok,
            "audit_dir": audit_ok,
            "state_files": state_ok,
        });
        if !(db_ok && config_ok && audit_ok && state_ok) {
            anyhow::bail!("health checks failed: {}", details);
        }
        Ok(details)
    }

    fn phase_broker(&mut self, dry_run: bool) -> Result<Value> {
        if dry_run {
            return Ok(json!({ "mocked": true, "would": "reconnect broker" }));
        }
        let connected = self.broker.initialize();
        let account = self.broker.account_info().is_some();
        let market_data = self.broker.market_data_available();
        self.broker.shutdown();
        let details = json!({
            "connected": connected,
            "account_info": account,
            "market_data": market_data,
        });
        if !connected {
            anyhow::bail!("broker connection failed: {}", details);
        }
        Ok(details)
    }

    fn phase_reconcile(&mut self, dry_run: bool) -> Result<Value> {
        if dry_run {
            return Ok(json!({ "mocked": true, "would": "reconcile positions" }));
        }
        let manager = RestoreManager::new(self.cfg.clone());
        let discrepancies = manager.reconcile(Some(self.broker.as_mut()))?;
        if !discrepancies.is_empty() {
            anyhow::bail!("{} position discrepancies", discrepancies.len());
        }
        Ok(json!({ "discrepancies": 0 }))
    }

    /// Removes failure-simulation stashes and stale extraction dirs, success
    /// or not.
    fn cleanup(&self, dry_run: bool) {
        if dry_run {
            return;
        }
        for dir in [&self.cfg.failure_backup_dir, &self.cfg.temp_restore_dir] {
            if dir.exists() {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
        logging::info(Domain::Drill, "cleanup_done", obj(&[]));
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn check_databases(db_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(db_dir) else {
        return false;
    };
    let mut seen = false;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !path.is_file() || !matches!(ext, "db" | "sqlite" | "sqlite3") {
            continue;
        }
        seen = true;
        let ok = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .and_then(|conn| conn.query_row("PRAGMA integrity_check", [], |r| r.get::<_, String>(0)))
            .map(|verdict| verdict == "ok")
            .unwrap_or(false);
        if !ok {
            return false;
        }
    }
    seen
}

fn check_configs(configs_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(configs_dir) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .any(|e| e.path().is_file() && std::fs::read_to_string(e.path()).is_ok())
}

// =============================================================================
// Smoke tests: pure functional checks, no I/O.
// =============================================================================

fn phase_smoke_tests() -> Result<Value> {
    let checks = [
        ("order_validation", smoke_order_validation()),
        ("risk_calculation", smoke_risk_calculation()),
        ("audit_parsing", smoke_audit_parsing()),
        ("logging", smoke_logging()),
    ];
    let details: Value = checks
        .iter()
        .map(|(name, ok)| ((*name).to_string(), Value::Bool(*ok)))
        .collect::<serde_json::Map<_, _>>()
        .into();
    if checks.iter().any(|(_, ok)| !ok) {
        anyhow::bail!("smoke tests failed: {}", details);
    }
    Ok(details)
}

fn valid_order(symbol: &str, qty: f64, price: f64) -> bool {
    !symbol.is_empty() && qty > 0.0 && price > 0.0 && qty.is_finite() && price.is_finite()
}

fn smoke_order_validation() -> bool {
    valid_order("BTCUSDT", 0.5, 30_000.0)
        && !valid_order("", 0.5, 30_000.0)
        && !valid_order("BTCUSDT", -1.0, 30_000.0)
        && !valid_order("BTCUSDT", 0.5, 0.0)
        && !valid_order("BTCUSDT", f64::NAN, 30_000.0)
}

fn smoke_risk_calculation() -> bool {
    // Position sizing: equity * risk fraction / stop distance.
    let size: f64 = (10_000.0 * 0.01) / (30_000.0 * 0.004);
    (size - 0.8333).abs() < 0.001 && size > 0.0
}

fn smoke_audit_parsing() -> bool {
    let line = r#"{"ts":1700000000,"iso_ts":"2023-11-14T22:13:20Z","event":"OrderAccepted","category":"order"}"#;
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("event").and_then(Value::as_str).map(String::from))
        .map(|e| e == "OrderAccepted")
        .unwrap_or(false)
}

fn smoke_logging() -> bool {
    logging::info(Domain::Drill, "smoke_log_check", obj(&[]));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{NullBroker, StubBroker};
    use crate::store::{OrderRow, SqliteOrderStore};

    fn populated_config(root: &Path) -> Config {
        let cfg = Config::rooted(root);
        for dir in [&cfg.db_dir, &cfg.configs_dir, &cfg.logs_dir, &cfg.audit_dir, &cfg.state_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        let store = SqliteOrderStore::open(&cfg.db_dir.join("orders.db")).unwrap();
        store.init().unwrap();
        store
            .insert_order(&OrderRow {
                ts: 100,
                order_id: "o1".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: "BUY".to_string(),
                quantity: 0.6,
                price: 100.0,
                status: "filled".to_string(),
                strategy: String::new(),
            })
            .unwrap();
        std::fs::write(cfg.configs_dir.join("app.toml"), "mode = \"live\"\n").unwrap();
        std::fs::write(cfg.audit_dir.join("audit-20260101.jsonl"), "{\"event\":\"Login\"}\n").unwrap();
        std::fs::write(cfg.state_dir.join("positions.json"), "{\"BTCUSDT\":0.6}\n").unwrap();
        cfg
    }

    #[test]
    fn test_phase_table_order_and_criticality() {
        let names: Vec<_> = PHASE_TABLE.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            names,
            [
                "backup_creation",
                "failure_simulation",
                "system_restore",
                "health_verification",
                "broker_reconnection",
                "position_reconciliation",
                "smoke_tests",
            ]
        );
        let critical: Vec<_> = PHASE_TABLE.iter().map(|(_, c)| *c).collect();
        assert_eq!(critical, [true, true, true, true, false, false, true]);
    }

    #[test]
    fn test_smoke_battery_passes() {
        let details = phase_smoke_tests().unwrap();
        assert_eq!(details["order_validation"], true);
        assert_eq!(details["risk_calculation"], true);
        assert_eq!(details["audit_parsing"], true);
        assert_eq!(details["logging"], true);
    }

    #[test]
    fn test_dry_run_succeeds_and_runs_all_phases() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = populated_config(dir.path());
        let mut drill = DrillOrchestrator::new(cfg, Box::new(NullBroker));
        let report = drill.run(true).unwrap();
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.phases.len(), PHASE_TABLE.len());
        assert!((report.metrics.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_drill_recovers_from_simulated_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = populated_config(dir.path());
        // Broker holds the same net position as the restored store.
        let broker = StubBroker::with_positions(&[("BTCUSDT", 0.6, 100.0)]);
        let mut drill = DrillOrchestrator::new(cfg.clone(), Box::new(broker));

        let report = drill.run(false).unwrap();
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.metrics.completed_phases, PHASE_TABLE.len());
        // The corrupted database was restored to a healthy state.
        assert!(check_databases(&cfg.db_dir));
        // Cleanup ran.
        assert!(!cfg.failure_backup_dir.exists());
    }

    #[test]
    fn test_critical_failure_aborts_remaining_phases() {
        let dir = tempfile::tempdir().unwrap();
        // Empty layout: backup itself works, but health checks cannot pass
        // because there are no databases or configs at all.
        let cfg = Config::rooted(dir.path());
        std::fs::create_dir_all(&cfg.backup_dir).unwrap();
        let mut drill = DrillOrchestrator::new(cfg, Box::new(NullBroker));

        let report = drill.run(false).unwrap();
        assert!(!report.success);
        assert!(!report.errors.is_empty());
        assert!(report.phases.len() < PHASE_TABLE.len());
        assert_eq!(
            report.phases.last().unwrap().status,
            PhaseStatus::Failed
        );
    }
}

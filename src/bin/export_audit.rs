//! Daily audit evidence pack exporter.

use chrono::{Duration, NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;

use tradeguard::audit::AuditLogger;
use tradeguard::export::AuditExporter;
use tradeguard::snapshot::{ConfigSnapshotter, GitDiff};
use tradeguard::state::Config;
use tradeguard::store::{OrderStore, SqliteOrderStore};

#[derive(Parser)]
#[command(name = "export_audit", about = "Export one day's regulatory evidence pack")]
struct Args {
    /// Day to export (YYYY-MM-DD). Defaults to yesterday UTC.
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Export root directory.
    #[arg(long, env = "EXPORT_DIR")]
    output_dir: Option<PathBuf>,

    /// Export retention window in days.
    #[arg(long, env = "EXPORT_RETENTION_DAYS")]
    retention_days: Option<u32>,
}

fn main() {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(dir) = args.output_dir.clone() {
        cfg.export_dir = dir;
    }
    let retention = args.retention_days.unwrap_or(cfg.export_retention_days);
    let date = args
        .date
        .unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));

    if let Err(err) = run(&cfg, date, retention) {
        eprintln!("export error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(cfg: &Config, date: NaiveDate, retention: u32) -> anyhow::Result<()> {
    let audit = AuditLogger::new(&cfg.audit_dir)?;
    let snapshotter = ConfigSnapshotter::new(
        cfg.config_dirs.clone(),
        &cfg.snapshot_dir,
        Some(Box::new(GitDiff::new(cfg.command_timeout_secs))),
    )?;

    let db_path = cfg.db_dir.join("orders.db");
    let store = if db_path.is_file() {
        Some(SqliteOrderStore::open(&db_path)?)
    } else {
        None
    };

    let exporter = AuditExporter::new(
        &cfg.export_dir,
        &audit,
        store.as_ref().map(|s| s as &dyn OrderStore),
        Some(&snapshotter),
    );
    let result = exporter.export_daily_audit_pack(date, retention)?;

    println!("export {} -> {}", date, result.export_dir.display());
    println!(
        "  {} files, {} bytes",
        result.manifest.summary.total_files, result.manifest.summary.total_size
    );
    for name in result.manifest.files.keys() {
        println!("  {}", name);
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    if result.removed_old_exports > 0 {
        println!("  pruned: {} old exports", result.removed_old_exports);
    }
    Ok(())
}

//! Backup tool: stage, checksum, archive, verify, prune.

use clap::Parser;
use std::path::PathBuf;

use tradeguard::backup::BackupManager;
use tradeguard::state::Config;

#[derive(Parser)]
#[command(name = "backup", about = "Create a verified full-system backup archive")]
struct Args {
    /// Only databases, audit trail, and state files.
    #[arg(long)]
    incremental: bool,

    /// Archive retention window in days.
    #[arg(long, env = "BACKUP_RETENTION_DAYS")]
    retention_days: Option<u32>,

    /// Where archives are written.
    #[arg(long, env = "BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Skip the post-pack archive verification.
    #[arg(long)]
    no_verify: bool,

    /// Print the full result as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Suppress the human-readable summary.
    #[arg(long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(days) = args.retention_days {
        cfg.backup_retention_days = days;
    }
    if let Some(dir) = args.backup_dir.clone() {
        cfg.backup_dir = dir;
    }

    let manager = BackupManager::new(cfg);
    let result = match manager.run_backup(!args.incremental, !args.no_verify) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("backup error: {:#}", err);
            std::process::exit(1);
        }
    };

    if !args.quiet {
        println!("backup {}: {}", result.backup_id, if result.success { "ok" } else { "FAILED" });
        if let Some(path) = &result.archive_path {
            println!("  archive:  {} ({} bytes)", path.display(), result.archive_size);
        }
        if let Some(verified) = result.verified {
            println!("  verified: {}", verified);
        }
        for (name, report) in &result.components {
            println!(
                "  {}: {} files, {} bytes{}",
                name,
                report.file_count,
                report.total_size,
                if report.errors.is_empty() {
                    String::new()
                } else {
                    format!(", {} errors", report.errors.len())
                }
            );
        }
        if result.removed_old_backups > 0 {
            println!("  pruned:   {} old archives", result.removed_old_backups);
        }
        for err in &result.errors {
            println!("  error: {}", err);
        }
    }
    if args.json {
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{}", text),
            Err(err) => eprintln!("json encode error: {}", err),
        }
    }

    std::process::exit(if result.success { 0 } else { 1 });
}

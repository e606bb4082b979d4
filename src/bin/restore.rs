//! Restore tool: verify an archive, safety-copy live state, restore
//! selected components, reconcile positions.

use clap::Parser;
use std::path::PathBuf;

use tradeguard::broker::NullBroker;
use tradeguard::restore::{Component, RestoreManager, RestoreOptions};
use tradeguard::state::Config;

#[derive(Parser)]
#[command(name = "restore", about = "Restore system state from a backup archive")]
struct Args {
    /// Backup archive (.tar.gz) to restore from.
    archive: PathBuf,

    /// Component to restore (repeatable). Defaults to all.
    #[arg(long = "component", value_name = "NAME")]
    components: Vec<Component>,

    /// Skip archive integrity verification. Dangerous.
    #[arg(long)]
    no_verify: bool,

    /// Skip position reconciliation after a database restore.
    #[arg(long)]
    no_reconcile: bool,

    /// Verify and report only; mutate nothing.
    #[arg(long)]
    dry_run: bool,

    /// Print the full result as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Suppress the human-readable summary.
    #[arg(long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    let cfg = Config::from_env();

    let opts = RestoreOptions {
        components: if args.components.is_empty() {
            Component::ALL.to_vec()
        } else {
            args.components.clone()
        },
        verify: !args.no_verify,
        reconcile: !args.no_reconcile,
        dry_run: args.dry_run,
    };

    let mut broker = NullBroker;
    let manager = RestoreManager::new(cfg);
    let result = match manager.run_restore(&args.archive, &opts, Some(&mut broker)) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("restore error: {:#}", err);
            std::process::exit(1);
        }
    };

    if !args.quiet {
        let verdict = match (result.success, result.dry_run) {
            (true, true) => "ok (dry run)",
            (true, false) => "ok",
            (false, _) => "FAILED",
        };
        println!("restore {}: {}", args.archive.display(), verdict);
        if let Some(safety) = &result.safety_copy {
            println!("  safety copy: {}", safety.display());
        }
        for (name, report) in &result.components {
            println!(
                "  {}: {} restored, {} verified, {} failed",
                name,
                report.restored.len(),
                report.verified.len(),
                report.failed.len()
            );
            for failure in &report.failed {
                println!("    failed: {}", failure);
            }
        }
        for d in &result.discrepancies {
            println!(
                "  discrepancy {}: local {} vs broker {}",
                d.symbol, d.local, d.broker
            );
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

//! Disaster-recovery drill tool.

use clap::Parser;

use tradeguard::broker::NullBroker;
use tradeguard::drill::{DrillOrchestrator, PhaseStatus};
use tradeguard::state::Config;

#[derive(Parser)]
#[command(name = "dr_drill", about = "Run the disaster-recovery drill end to end")]
struct Args {
    /// Mock the destructive phases; run only read-only checks.
    #[arg(long)]
    dry_run: bool,

    /// Print the per-phase report.
    #[arg(long)]
    report: bool,

    /// Print the full report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Suppress the human-readable summary.
    #[arg(long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    let cfg = Config::from_env();

    let mut drill = DrillOrchestrator::new(cfg, Box::new(NullBroker));
    let report = match drill.run(args.dry_run) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("drill error: {:#}", err);
            std::process::exit(1);
        }
    };

    if !args.quiet {
        println!(
            "drill {}: {}{}",
            report.drill_id,
            if report.success { "GO" } else { "NO-GO" },
            if report.dry_run { " (dry run)" } else { "" }
        );
        println!(
            "  phases: {}/{} completed ({:.0}%)",
            report.metrics.completed_phases,
            report.metrics.total_phases,
            report.metrics.success_rate * 100.0
        );
        for err in &report.errors {
            println!("  error: {}", err);
        }
    }
    if args.report && !args.quiet {
        for phase in &report.phases {
            let mark = match phase.status {
                PhaseStatus::Success => "ok",
                PhaseStatus::Failed => "FAILED",
                PhaseStatus::Running => "running",
            };
            println!("  {:<24} {:>8} {:.2}s", phase.name, mark, phase.duration_secs);
        }
    }
    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(err) => eprintln!("json encode error: {}", err),
        }
    }

    std::process::exit(if report.success { 0 } else { 1 });
}

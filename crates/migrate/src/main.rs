use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use quoteflow_migrate::{JsonSnapshot, MigrationPlan, reconcile};

#[derive(Debug, Parser)]
#[command(name = "quoteflow-migrate")]
#[command(about = "Reconcile a legacy quotation-request snapshot")]
struct Args {
    /// Legacy database snapshot (JSON)
    snapshot: PathBuf,

    /// Migration plan overriding the default tables and markers
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Where to write the reconciled snapshot (defaults to in place)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Report what would change without writing anything
    #[arg(long)]
    dry_run: bool,
}

fn main() -> anyhow::Result<()> {
    quoteflow_observability::init();

    let args = Args::parse();

    let plan = match &args.plan {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading plan {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing plan {}", path.display()))?
        }
        None => MigrationPlan::default(),
    };

    let mut db = JsonSnapshot::load(&args.snapshot)
        .with_context(|| format!("loading snapshot {}", args.snapshot.display()))?;
    let report = reconcile(&mut db, &plan)?;

    if args.dry_run {
        tracing::info!("dry run; snapshot left untouched");
    } else if report.changed() {
        let written = db.save(args.out.as_deref())?;
        tracing::info!(path = %written.display(), "snapshot written");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

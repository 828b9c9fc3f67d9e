use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use coherence_kernel_core::{
    build_attestation_matrices, build_local_stemmata, materialize_affinity, run_coherence,
    AttestationMatrices, Snapshot,
};
use coherence_kernel_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Coherence Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./coherence_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    Affinity {
        #[command(subcommand)]
        command: AffinityCommand,
    },
    Substemma {
        #[command(subcommand)]
        command: SubstemmaCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Import(SnapshotImportArgs),
    Show,
}

#[derive(Debug, Args)]
struct SnapshotImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    Compute,
    List,
}

#[derive(Debug, Subcommand)]
enum AffinityCommand {
    Show(AffinityShowArgs),
    Rank(AffinityRankArgs),
}

#[derive(Debug, Args)]
struct AffinityShowArgs {
    #[arg(long)]
    run: String,
    #[arg(long, default_value_t = 0)]
    range: usize,
    #[arg(long)]
    ms1: Option<usize>,
    #[arg(long, default_value_t = 25)]
    top: usize,
}

#[derive(Debug, Args)]
struct AffinityRankArgs {
    #[arg(long)]
    run: String,
    #[arg(long, default_value_t = 0)]
    range: usize,
    #[arg(long)]
    ms1: usize,
    #[arg(long, default_value_t = 10)]
    top: usize,
}

#[derive(Debug, Subcommand)]
enum SubstemmaCommand {
    Greedy(SubstemmaGreedyArgs),
    Exhaustive(SubstemmaExhaustiveArgs),
}

#[derive(Debug, Args)]
struct SubstemmaGreedyArgs {
    #[arg(long)]
    target: usize,
    #[arg(long = "pool")]
    pool: Vec<usize>,
    #[arg(long, default_value_t = 5)]
    max_size: usize,
}

#[derive(Debug, Args)]
struct SubstemmaExhaustiveArgs {
    #[arg(long)]
    target: usize,
    #[arg(long = "candidate")]
    candidates: Vec<usize>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(&command, &mut store),
        Command::Snapshot { command } => run_snapshot(&command, &mut store),
        Command::Run { command } => run_run(&command, &mut store),
        Command::Affinity { command } => run_affinity(&command, &store),
        Command::Substemma { command } => run_substemma(&command, &store),
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn run_snapshot(command: &SnapshotCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        SnapshotCommand::Import(args) => {
            store.migrate()?;
            let body = fs::read_to_string(&args.input).with_context(|| {
                format!("failed to read snapshot file {}", args.input.display())
            })?;
            let snapshot: Snapshot = serde_json::from_str(&body).with_context(|| {
                format!("failed to parse snapshot file {}", args.input.display())
            })?;
            let digest = store.import_snapshot(&snapshot)?;
            emit_json(serde_json::json!({
                "in_file": args.input,
                "snapshot_digest": digest,
                "manuscripts": snapshot.manuscript_count,
                "locations": snapshot.location_count,
                "ranges": snapshot.ranges.len(),
                "stemma_edges": snapshot.stemma_edges.len(),
                "attestations": snapshot.attestations.len()
            }))
        }
        SnapshotCommand::Show => {
            let snapshot = store.load_snapshot()?;
            emit_json(serde_json::json!({
                "snapshot_digest": snapshot.digest(),
                "manuscripts": snapshot.manuscript_count,
                "locations": snapshot.location_count,
                "base_manuscript": snapshot.base_manuscript,
                "ranges": snapshot.ranges,
                "stemma_edges": snapshot.stemma_edges.len(),
                "attestations": snapshot.attestations.len()
            }))
        }
    }
}

fn run_run(command: &RunCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        RunCommand::Compute => {
            let snapshot = store.load_snapshot()?;
            let run = run_coherence(&snapshot, OffsetDateTime::now_utc())
                .map_err(|err| anyhow!("coherence run failed: {err}"))?;
            let records = materialize_affinity(&run.matrices);
            let saved = store.save_run(&run, &records)?;
            emit_json(serde_json::json!({
                "run_id": run.run_id.to_string(),
                "snapshot_digest": run.snapshot_digest,
                "computed_at": run.computed_at.format(&time::format_description::well_known::Rfc3339)?,
                "ranges": run.matrices.range_count,
                "affinity_records": saved,
                "clean": run.diagnostics.is_clean(),
                "diagnostics": serde_json::to_value(&run.diagnostics)?
            }))
        }
        RunCommand::List => {
            let runs = store.list_runs()?;
            emit_json(serde_json::json!({ "runs": runs }))
        }
    }
}

fn run_affinity(command: &AffinityCommand, store: &SqliteStore) -> Result<()> {
    match command {
        AffinityCommand::Show(args) => {
            let mut records = store.load_affinity(&args.run, args.range)?;
            if let Some(ms1) = args.ms1 {
                records.retain(|record| record.ms1 == ms1);
            }
            records.truncate(args.top);
            emit_json(serde_json::json!({
                "run_id": args.run,
                "range": args.range,
                "records": records
            }))
        }
        AffinityCommand::Rank(args) => {
            let mut records = store.load_affinity(&args.run, args.range)?;
            records.retain(|record| record.ms1 == args.ms1);
            records.truncate(args.top);
            let ranked: Vec<Value> = records
                .iter()
                .map(|record| {
                    // `newer > older` means the partner's reading is the
                    // ancestral one more often, i.e. a potential ancestor.
                    let direction = if record.newer > record.older {
                        "potential_ancestor"
                    } else if record.older > record.newer {
                        "potential_descendant"
                    } else {
                        "undirected"
                    };
                    serde_json::json!({
                        "ms2": record.ms2,
                        "affinity": record.affinity,
                        "common": record.common,
                        "equal": record.equal,
                        "older": record.older,
                        "newer": record.newer,
                        "unclear": record.unclear,
                        "direction": direction
                    })
                })
                .collect();
            emit_json(serde_json::json!({
                "run_id": args.run,
                "range": args.range,
                "ms1": args.ms1,
                "ranked": ranked
            }))
        }
    }
}

fn attestation_matrices(store: &SqliteStore) -> Result<(Snapshot, AttestationMatrices)> {
    let snapshot = store.load_snapshot()?;
    snapshot.validate().map_err(|err| anyhow!("stored snapshot is invalid: {err}"))?;
    let stemmata = build_local_stemmata(&snapshot);
    let matrices = build_attestation_matrices(&snapshot, &stemmata);
    Ok((snapshot, matrices))
}

fn run_substemma(command: &SubstemmaCommand, store: &SqliteStore) -> Result<()> {
    match command {
        SubstemmaCommand::Greedy(args) => {
            let (_, matrices) = attestation_matrices(store)?;
            let entries =
                coherence_kernel_core::substemma_greedy(&matrices, args.target, &args.pool, args.max_size)
                    .map_err(|err| anyhow!("greedy substemma search failed: {err}"))?;
            emit_json(serde_json::json!({
                "mode": "greedy",
                "target": args.target,
                "pool": args.pool,
                "max_size": args.max_size,
                "entries": entries
            }))
        }
        SubstemmaCommand::Exhaustive(args) => {
            let (_, matrices) = attestation_matrices(store)?;
            let entries =
                coherence_kernel_core::substemma_exhaustive(&matrices, args.target, &args.candidates)
                    .map_err(|err| anyhow!("exhaustive substemma search failed: {err}"))?;
            emit_json(serde_json::json!({
                "mode": "exhaustive",
                "target": args.target,
                "candidates": args.candidates,
                "entries": entries
            }))
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use traffic_ingest_core::{
    plan_batches, GeneratorConfig, IngestParams, SeededIdentitySource, UniformTrafficGenerator,
    DEFAULT_MAX_LOAD_BYTES,
};
use traffic_ingest_store_sqlite::{IngestionEngine, SqliteStore, StorageTarget};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ti")]
#[command(about = "Traffic ingestion CLI")]
struct Cli {
    #[arg(long, default_value = "./traffic_ingest.sqlite3")]
    db: PathBuf,

    /// How long a writer waits for a competing write lock.
    #[arg(long, default_value_t = 5_000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate entities with per-minute traffic and store them.
    Ingest(IngestArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Summarise stored entities and their traffic.
    Report,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    EnsureSchema,
    SchemaStatus,
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    entities: String,
    /// Interval start, `dd.MM.yyyy HH:mm` (UTC).
    #[arg(long)]
    start: String,
    /// Interval end, `dd.MM.yyyy HH:mm` (UTC).
    #[arg(long)]
    end: String,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = DEFAULT_MAX_LOAD_BYTES)]
    max_load_bytes: u32,
}

#[derive(Debug, Serialize)]
struct EntityReport {
    entity_id: i64,
    first_name: String,
    last_name: String,
    city: String,
    address: String,
    traffic_records: usize,
    total_loaded_bytes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    first_minute: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    last_minute: Option<OffsetDateTime>,
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

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) =
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init()
    {
        tracing::debug!(error = %err, "keeping previously installed tracing subscriber");
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let target = StorageTarget::new(cli.db.clone())
        .with_busy_timeout(Duration::from_millis(cli.busy_timeout_ms));
    let engine = IngestionEngine::new(target);

    match cli.command {
        Command::Ingest(args) => run_ingest(&args, &engine),
        Command::Db { command } => run_db(&command, &engine),
        Command::Report => run_report(&engine),
    }
}

fn run_ingest(args: &IngestArgs, engine: &IngestionEngine) -> Result<()> {
    let params = IngestParams::parse(&args.entities, &args.start, &args.end)?;
    let config = GeneratorConfig { max_load_bytes: args.max_load_bytes, seed: args.seed };
    let mut identities = match args.seed {
        Some(seed) => SeededIdentitySource::new(seed),
        None => SeededIdentitySource::from_entropy(),
    };
    let mut generator = UniformTrafficGenerator::new(&config);

    let batches = plan_batches(&params, &mut identities, &mut generator)
        .context("failed to plan ingestion run")?;
    tracing::info!(
        entities = batches.len(),
        minutes = batches.first().map_or(0, |batch| batch.traffic.len()),
        "ingestion planned"
    );

    let mut store = engine.open_store()?;
    let summary = engine.store_all(&mut store, &batches)?;
    emit_json(serde_json::json!({
        "db": engine.target().path,
        "params": params,
        "max_load_bytes": config.max_load_bytes,
        "seed": config.seed,
        "summary": summary
    }))
}

fn run_db(command: &DbCommand, engine: &IngestionEngine) -> Result<()> {
    let mut store = engine.open_store()?;
    match command {
        DbCommand::EnsureSchema => run_db_ensure_schema(engine, &mut store),
        DbCommand::SchemaStatus => run_db_schema_status(&store),
        DbCommand::IntegrityCheck => run_db_integrity_check(&store),
    }
}

fn run_db_ensure_schema(engine: &IngestionEngine, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    engine.ensure_schema(store)?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_schema_status(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_report(engine: &IngestionEngine) -> Result<()> {
    let store = engine.open_store()?;
    let status = store.schema_status()?;
    if !status.pending_versions.is_empty() {
        return emit_json(serde_json::json!({
            "schema_ready": false,
            "current_version": status.current_version,
            "entity_count": 0,
            "traffic_count": 0,
            "entities": []
        }));
    }

    let mut entities = Vec::new();
    for entity in store.list_entities()? {
        let Some(id) = entity.id else {
            continue;
        };
        let records = store.traffic_for_entity(id)?;
        entities.push(EntityReport {
            entity_id: id.0,
            first_name: entity.key.first_name,
            last_name: entity.key.last_name,
            city: entity.key.city,
            address: entity.key.address,
            traffic_records: records.len(),
            total_loaded_bytes: records.iter().map(|record| u64::from(record.loaded_bytes)).sum(),
            first_minute: records.first().map(|record| record.minute),
            last_minute: records.last().map(|record| record.minute),
        });
    }

    emit_json(serde_json::json!({
        "schema_ready": true,
        "current_version": status.current_version,
        "entity_count": store.count_entities()?,
        "traffic_count": store.count_traffic()?,
        "entities": entities
    }))
}

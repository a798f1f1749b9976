use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use artifact_ledger_core::{GenerationEvent, LedgerError};
use artifact_ledger_engine::{
    ingest, AuditOptions, Auditor, IngestOptions, LedgerConfig, Remediator,
};
use artifact_ledger_store_sqlite::{LedgerStore, MigrationRunner};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "ledger.v1";

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Artifact ledger: batched archive ingestion and consistency auditing")]
struct Cli {
    /// YAML configuration file; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tracing filter directive, e.g. `info` or `artifact_ledger_engine=debug`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Ingest(IngestArgs),
    Audit(AuditArgs),
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Migrate(DbMigrateArgs),
    Status(DbArgs),
    Health(DbArgs),
    Checkpoint(DbArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    migrations_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    analytics_db: Option<PathBuf>,
    #[arg(long = "pattern")]
    patterns: Vec<String>,
    #[arg(long, default_value_t = false)]
    checkpoint: bool,
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long = "source")]
    sources: Vec<PathBuf>,
    #[arg(long)]
    analytics_db: Option<PathBuf>,
    #[arg(long = "root")]
    roots: Vec<PathBuf>,
    #[arg(long = "table")]
    tables: Vec<String>,
    #[arg(long, default_value_t = false)]
    regenerate: bool,
    #[arg(long, default_value_t = false)]
    reingest: bool,
    #[arg(long)]
    stale_limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum EventsCommand {
    Audit(AnalyticsArgs),
    Ingest(AnalyticsArgs),
    Generation(AnalyticsArgs),
    RecordGeneration(RecordGenerationArgs),
}

#[derive(Debug, Args)]
struct AnalyticsArgs {
    #[arg(long)]
    analytics_db: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RecordGenerationArgs {
    #[arg(long)]
    analytics_db: Option<PathBuf>,
    #[arg(long)]
    kind: String,
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    #[arg(long)]
    template: Option<String>,
    #[arg(long)]
    error: Option<String>,
}

/// Runs an external program with the affected paths appended to its arguments.
struct CommandRemediator {
    argv: Vec<String>,
}

impl Remediator for CommandRemediator {
    fn remediate(&mut self, paths: &[PathBuf]) -> std::result::Result<(), String> {
        let Some((program, leading)) = self.argv.split_first() else {
            return Err("no command configured".to_string());
        };
        let status = std::process::Command::new(program)
            .args(leading)
            .args(paths)
            .status()
            .map_err(|err| format!("failed to start `{program}`: {err}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("`{program}` exited with {status}"))
        }
    }
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

/// Storage failures exit with 2, migration failures with 3, anything else with 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.chain().find_map(|cause| cause.downcast_ref::<LedgerError>()) {
        Some(LedgerError::StorageUnavailable { .. }) => 2,
        Some(LedgerError::MigrationFailed { .. }) => 3,
        _ => 1,
    }
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-level `{directive}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    // A subscriber installed earlier in the process keeps precedence.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.log_level.as_deref())?;
    let config = match cli.config.as_deref() {
        Some(path) => LedgerConfig::from_path(path)?,
        None => LedgerConfig::default(),
    };

    match cli.command {
        Command::Db { command } => run_db(command, &config),
        Command::Ingest(args) => run_ingest(&args, &config),
        Command::Audit(args) => run_audit(args, &config),
        Command::Events { command } => run_events(command, &config),
    }
}

fn require_path(flag: Option<&Path>, configured: Option<&Path>, name: &str) -> Result<PathBuf> {
    flag.or(configured)
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("--{name} is required (or set it in the configuration file)"))
}

fn open_store(path: &Path, config: &LedgerConfig) -> Result<LedgerStore> {
    Ok(LedgerStore::open_with(path, &config.connection())?)
}

fn open_migrated(path: &Path, config: &LedgerConfig) -> Result<LedgerStore> {
    let mut store = open_store(path, config)?;
    store.migrate()?;
    Ok(store)
}

fn run_db(command: DbCommand, config: &LedgerConfig) -> Result<()> {
    let assets = config.databases.assets.as_deref();
    match command {
        DbCommand::Migrate(args) => {
            let db = require_path(args.db.as_deref(), assets, "db")?;
            run_db_migrate(&db, args.migrations_dir.as_deref(), config)
        }
        DbCommand::Status(args) => {
            run_db_status(&require_path(args.db.as_deref(), assets, "db")?, config)
        }
        DbCommand::Health(args) => {
            run_db_health(&require_path(args.db.as_deref(), assets, "db")?, config)
        }
        DbCommand::Checkpoint(args) => {
            let db = require_path(args.db.as_deref(), assets, "db")?;
            let store = open_store(&db, config)?;
            let report = store.checkpoint()?;
            emit_json(serde_json::json!({
                "db": db.display().to_string(),
                "busy": report.busy,
                "log_frames": report.log_frames,
                "checkpointed_frames": report.checkpointed_frames
            }))
        }
    }
}

fn run_db_migrate(db: &Path, migrations_dir: Option<&Path>, config: &LedgerConfig) -> Result<()> {
    let runner = match migrations_dir {
        Some(dir) => MigrationRunner::from_dir(dir)?,
        None => MigrationRunner::builtin(),
    };
    let mut store = open_store(db, config)?;
    let report = runner.run(&mut store)?;
    emit_json(serde_json::json!({
        "db": db.display().to_string(),
        "declarative": report.declarative,
        "routines": report.routines,
        "applied_units": store.applied_units()?
    }))
}

fn run_db_status(db: &Path, config: &LedgerConfig) -> Result<()> {
    let store = open_store(db, config)?;
    let applied = store.applied_units()?;
    let pending = MigrationRunner::builtin()
        .unit_names()
        .into_iter()
        .filter(|unit| !applied.contains(unit))
        .collect::<Vec<_>>();
    let objects = store
        .schema_objects()?
        .into_iter()
        .map(|(kind, name)| serde_json::json!({ "type": kind, "name": name }))
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "db": db.display().to_string(),
        "applied_units": applied,
        "pending_units": pending,
        "up_to_date": pending.is_empty(),
        "schema_objects": objects
    }))
}

fn run_db_health(db: &Path, config: &LedgerConfig) -> Result<()> {
    let store = open_store(db, config)?;
    let check = store.health_check();
    emit_json(serde_json::json!({
        "db": db.display().to_string(),
        "database": check.database,
        "result": check.result,
        "ok": check.ok,
        "wal_size_bytes": store.wal_size_bytes()
    }))
}

fn run_ingest(args: &IngestArgs, config: &LedgerConfig) -> Result<()> {
    let db = require_path(args.db.as_deref(), config.databases.assets.as_deref(), "db")?;
    let analytics_path = args.analytics_db.as_deref().or(config.databases.analytics.as_deref());

    let mut assets = open_migrated(&db, config)?;
    let mut analytics = analytics_path.map(|path| open_migrated(path, config)).transpose()?;

    let options = IngestOptions {
        patterns: if args.patterns.is_empty() {
            config.ingest.patterns.clone()
        } else {
            args.patterns.clone()
        },
        checkpoint: args.checkpoint || config.ingest.checkpoint,
        checkpoint_threshold_bytes: Some(config.ingest.checkpoint_threshold_bytes),
        kind: "ingest".to_string(),
        source: "ledger-cli".to_string(),
        log_policy: config.audit.log_policy,
    };
    let summary = ingest(&mut assets, analytics.as_mut(), &args.inputs, &options)
        .context("ingestion failed")?;

    let mut payload = serde_json::to_value(&summary)?;
    if let Value::Object(object) = &mut payload {
        object.insert("db".to_string(), Value::String(db.display().to_string()));
    }
    emit_json(payload)
}

fn run_audit(args: AuditArgs, config: &LedgerConfig) -> Result<()> {
    let source_paths = if args.sources.is_empty() {
        config.databases.sources.clone()
    } else {
        args.sources
    };
    if source_paths.is_empty() {
        return Err(anyhow!("at least one --source database is required"));
    }
    let analytics_path = require_path(
        args.analytics_db.as_deref(),
        config.databases.analytics.as_deref(),
        "analytics-db",
    )?;

    let options = AuditOptions {
        roots: if args.roots.is_empty() { config.audit.roots.clone() } else { args.roots },
        source_tables: if args.tables.is_empty() {
            config.audit.source_tables.clone()
        } else {
            args.tables
        },
        stale_detail_limit: args.stale_limit.unwrap_or(config.audit.stale_detail_limit).max(1),
        log_policy: config.audit.log_policy,
    };

    let mut auditor = Auditor::new(options);
    if args.regenerate {
        let regenerator = remediator(&config.audit.regenerate_command, "regenerate")?;
        auditor = auditor.with_regenerator(regenerator);
    }
    if args.reingest {
        let reingester = remediator(&config.audit.reingest_command, "reingest")?;
        auditor = auditor.with_reingester(reingester);
    }

    let sources = source_paths
        .iter()
        .map(|path| open_store(path, config))
        .collect::<Result<Vec<_>>>()?;
    let mut analytics = open_migrated(&analytics_path, config)?;
    let report = auditor.run(&sources, &mut analytics).context("audit failed")?;

    emit_json(serde_json::json!({
        "status": report.event.status.as_str(),
        "missing_count": report.event.missing_count,
        "stale_count": report.event.stale_count,
        "regenerated_count": report.event.regenerated_count,
        "reingested_count": report.event.reingested_count,
        "audit_event_id": report.audit_event_id,
        "log_error": report.log_error,
        "event": report.event
    }))
}

fn remediator(argv: &[String], action: &str) -> Result<CommandRemediator> {
    if argv.is_empty() {
        return Err(LedgerError::Config(format!(
            "--{action} needs audit.{action}_command in the configuration file"
        ))
        .into());
    }
    Ok(CommandRemediator { argv: argv.to_vec() })
}

fn run_events(command: EventsCommand, config: &LedgerConfig) -> Result<()> {
    let open_analytics = |flag: Option<&Path>| -> Result<LedgerStore> {
        let path = require_path(flag, config.databases.analytics.as_deref(), "analytics-db")?;
        open_migrated(&path, config)
    };
    match command {
        EventsCommand::Audit(args) => {
            emit_events(&open_analytics(args.analytics_db.as_deref())?.list_audit_events()?)
        }
        EventsCommand::Ingest(args) => {
            emit_events(&open_analytics(args.analytics_db.as_deref())?.list_ingest_events()?)
        }
        EventsCommand::Generation(args) => {
            emit_events(&open_analytics(args.analytics_db.as_deref())?.list_generation_events()?)
        }
        EventsCommand::RecordGeneration(args) => {
            let mut store = open_analytics(args.analytics_db.as_deref())?;
            let event = GenerationEvent {
                kind: args.kind,
                source: args.source,
                target_path: args.target,
                template_id: args.template,
                created_at: OffsetDateTime::now_utc(),
                error: args.error,
            };
            let recorded = store.append_generation_events(std::slice::from_ref(&event))?;
            tracing::info!(target_path = %event.target_path, "generation event recorded");
            emit_json(serde_json::json!({ "recorded": recorded, "event": event }))
        }
    }
}

fn emit_events<T: serde::Serialize>(events: &[T]) -> Result<()> {
    emit_json(serde_json::json!({ "count": events.len(), "events": events }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let storage = anyhow::Error::from(LedgerError::storage(Path::new("a.db"), "locked"))
            .context("ingestion failed");
        let migration = anyhow::Error::from(LedgerError::MigrationFailed {
            unit: "0002_analytics_events.sql".to_string(),
            reason: "syntax error".to_string(),
        });
        let other = anyhow!("at least one --source database is required");

        assert_eq!(exit_code(&storage), 2);
        assert_eq!(exit_code(&migration), 3);
        assert_eq!(exit_code(&other), 1);
        assert_eq!(exit_code(&LedgerError::Config("bad".into()).into()), 1);
    }

    #[test]
    fn contract_version_is_added_to_objects_and_wraps_scalars() {
        let object = with_contract_version(serde_json::json!({ "inserted": 1 }));
        assert_eq!(object["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(object["inserted"], 1);

        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped["payload"], serde_json::json!([1, 2]));
    }
}

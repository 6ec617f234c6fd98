use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use classbook_api::{CalendarQuery, ClassbookApi};
use classbook_core::{parse_iso_date, CalendarEntry, ClassRecord};
use classbook_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cb")]
#[command(about = "Classbook CLI")]
struct Cli {
    #[arg(long, default_value = "./classbook.sqlite3")]
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
    Class {
        #[command(subcommand)]
        command: ClassCommand,
    },
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
    Calendar {
        #[command(subcommand)]
        command: CalendarCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Export(DbExportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ClassCommand {
    Add(ClassArgs),
    List(ClassListArgs),
}

#[derive(Debug, Args)]
struct ClassArgs {
    #[arg(long)]
    period: String,
    #[arg(long = "class")]
    class_name: String,
    #[arg(long, default_value = "")]
    classroom: String,
    #[arg(long)]
    semester: String,
}

impl ClassArgs {
    fn into_record(self) -> ClassRecord {
        ClassRecord {
            period: self.period,
            class_name: self.class_name,
            classroom: self.classroom,
            semester: self.semester,
        }
    }
}

/// Without a period every stored class is listed.
#[derive(Debug, Args)]
struct ClassListArgs {
    #[arg(long)]
    period: Option<String>,
    #[arg(long, default_value = "")]
    semester: String,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    Assign(ScheduleAssignArgs),
    Show(ScheduleShowArgs),
}

#[derive(Debug, Args)]
struct ScheduleAssignArgs {
    #[arg(long)]
    uid: String,
    #[command(flatten)]
    class: ClassArgs,
}

#[derive(Debug, Args)]
struct ScheduleShowArgs {
    #[arg(long)]
    uid: String,
    #[arg(long)]
    semester: String,
}

#[derive(Debug, Subcommand)]
enum CalendarCommand {
    Add(CalendarAddArgs),
    Show(CalendarShowArgs),
}

#[derive(Debug, Args)]
struct CalendarAddArgs {
    #[arg(long)]
    date: String,
    #[arg(long)]
    hw: String,
    #[arg(long, default_value_t = 0)]
    period: i64,
    #[arg(long = "class", default_value = "")]
    class_name: String,
    #[arg(long, default_value = "")]
    semester: String,
}

#[derive(Debug, Args)]
struct CalendarShowArgs {
    #[arg(long = "class", default_value = "")]
    class_name: String,
    #[arg(long, default_value = "0")]
    period: String,
    #[arg(long, default_value = "")]
    semester: String,
    /// `YYYY-MM-DD`; defaults to the current UTC date.
    #[arg(long)]
    today: Option<String>,
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
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Class { command } => run_class(command, &cli.db),
        Command::Schedule { command } => run_schedule(command, &ClassbookApi::new(cli.db)),
        Command::Calendar { command } => run_calendar(command, &ClassbookApi::new(cli.db)),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Export(args) => run_db_export(&args, store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_class(command: ClassCommand, db: &Path) -> Result<()> {
    let api = ClassbookApi::new(db.to_path_buf());
    match command {
        ClassCommand::Add(args) => {
            let record = api.add_class(args.into_record())?;
            emit_json(serde_json::json!({ "class": record, "class_key": record.identity_key() }))
        }
        ClassCommand::List(args) => {
            let classes = match args.period.as_deref() {
                Some(period) => api.class_list(period, &args.semester)?,
                None => {
                    let mut store = SqliteStore::open(db)?;
                    store.migrate()?;
                    store.list_classes()?
                }
            };
            emit_json(serde_json::json!({ "classes": classes }))
        }
    }
}

fn run_schedule(command: ScheduleCommand, api: &ClassbookApi) -> Result<()> {
    match command {
        ScheduleCommand::Assign(args) => {
            let schedule = api.assign_class(&args.uid, &args.class.into_record())?;
            emit_json(serde_json::json!({ "schedule": schedule }))
        }
        ScheduleCommand::Show(args) => {
            let classes = api.schedule_classes(&args.uid, &args.semester)?;
            emit_json(serde_json::json!({
                "uid": args.uid,
                "semester": args.semester,
                "classes": classes
            }))
        }
    }
}

fn run_calendar(command: CalendarCommand, api: &ClassbookApi) -> Result<()> {
    match command {
        CalendarCommand::Add(args) => {
            let stored = api.add_calendar_entry(CalendarEntry {
                date: args.date,
                homework: args.hw,
                period: args.period,
                class_name: args.class_name,
                semester: args.semester,
            })?;
            emit_json(serde_json::to_value(&stored).context("failed to serialize calendar entry")?)
        }
        CalendarCommand::Show(args) => {
            let today = match args.today.as_deref() {
                Some(value) => parse_iso_date(value)?,
                None => OffsetDateTime::now_utc().date(),
            };
            let query = CalendarQuery {
                class_name: args.class_name,
                period: args.period,
                semester: args.semester,
            };
            let window = api.calendar(&query, today)?;
            emit_json(serde_json::json!({ "query": query, "entries": window }))
        }
    }
}

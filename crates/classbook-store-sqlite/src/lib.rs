use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use classbook_core::{
    schedule_key, CalendarEntry, CalendarScope, ClassRecord, DocumentKind, ScheduleEntry,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS classes (
  class_key TEXT PRIMARY KEY,
  period TEXT NOT NULL,
  class_name TEXT NOT NULL,
  classroom TEXT NOT NULL,
  semester TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
  schedule_key TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  semester TEXT NOT NULL,
  class_keys_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar_entries (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  date TEXT NOT NULL,
  homework TEXT NOT NULL,
  written_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_calendar_entries_date ON calendar_entries(date);
";

const MIGRATION_002_COLUMNS: [(&str, &str); 3] = [
    ("period", "ALTER TABLE calendar_entries ADD COLUMN period INTEGER NOT NULL DEFAULT 0"),
    ("class_name", "ALTER TABLE calendar_entries ADD COLUMN class_name TEXT NOT NULL DEFAULT ''"),
    ("semester", "ALTER TABLE calendar_entries ADD COLUMN semester TEXT NOT NULL DEFAULT ''"),
];

const MIGRATION_002_INDEXES_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_calendar_entries_scope
  ON calendar_entries(class_name, period, semester, date);
CREATE INDEX IF NOT EXISTS idx_classes_period_semester ON classes(period, semester);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub kind: DocumentKind,
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DanglingClassKey {
    pub schedule_key: String,
    pub class_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub dangling_class_keys: Vec<DanglingClassKey>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed document store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "calendar_entries")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        // Tables written before migrations were tracked.
        record_schema_version(&self.conn, 1)?;
        if table_has_column(&self.conn, "calendar_entries", "semester")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        for (column, statement) in MIGRATION_002_COLUMNS {
            if !table_has_column(&tx, "calendar_entries", column)? {
                tx.execute_batch(statement).with_context(|| {
                    format!("failed to add calendar_entries.{column} in migration v2")
                })?;
            }
        }
        tx.execute_batch(MIGRATION_002_INDEXES_SQL).context("failed to create v2 indexes")?;
        record_schema_version(&tx, 2)?;

        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Insert or overwrite one class keyed by its identity key.
    ///
    /// # Errors
    /// Returns an error when validation or the write fails.
    pub fn put_class(&mut self, record: &ClassRecord) -> Result<()> {
        record.validate().map_err(|err| anyhow!("class validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO classes(class_key, period, class_name, classroom, semester)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(class_key) DO UPDATE SET
                   period = excluded.period,
                   class_name = excluded.class_name,
                   classroom = excluded.classroom,
                   semester = excluded.semester",
                params![
                    record.identity_key(),
                    record.period,
                    record.class_name,
                    record.classroom,
                    record.semester,
                ],
            )
            .with_context(|| format!("failed to write class {}", record.identity_key()))?;
        Ok(())
    }

    /// Resolve class identity keys, preserving input order; unknown keys yield `None`.
    ///
    /// # Errors
    /// Returns an error when a lookup fails.
    pub fn get_classes(&self, class_keys: &[String]) -> Result<Vec<Option<ClassRecord>>> {
        let mut stmt = self.conn.prepare(
            "SELECT period, class_name, classroom, semester FROM classes WHERE class_key = ?1",
        )?;

        let mut classes = Vec::with_capacity(class_keys.len());
        for class_key in class_keys {
            let record = stmt
                .query_row(params![class_key], class_from_row)
                .optional()
                .with_context(|| format!("failed to load class {class_key}"))?;
            classes.push(record);
        }
        Ok(classes)
    }

    /// All classes offered in one period of one semester.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn query_classes(&self, period: &str, semester: &str) -> Result<Vec<ClassRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT period, class_name, classroom, semester FROM classes
             WHERE period = ?1 AND semester = ?2
             ORDER BY class_key ASC",
        )?;
        let rows = stmt.query_map(params![period, semester], class_from_row)?;

        let mut classes = Vec::new();
        for row in rows {
            classes.push(row.context("failed to decode class row")?);
        }
        Ok(classes)
    }

    /// Load every class, ordered by identity key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_classes(&self) -> Result<Vec<ClassRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT period, class_name, classroom, semester FROM classes ORDER BY class_key ASC",
        )?;
        let rows = stmt.query_map([], class_from_row)?;

        let mut classes = Vec::new();
        for row in rows {
            classes.push(row.context("failed to decode class row")?);
        }
        Ok(classes)
    }

    /// Load the schedule for one user and semester.
    ///
    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn get_schedule(&self, user_id: &str, semester: &str) -> Result<Option<ScheduleEntry>> {
        load_schedule(&self.conn, &schedule_key(user_id, semester))
    }

    /// Insert or overwrite one schedule keyed by user and semester.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put_schedule(&mut self, schedule: &ScheduleEntry) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        write_schedule(&tx, schedule)?;
        tx.commit().context("failed to commit schedule transaction")?;
        Ok(())
    }

    /// Read, edit and write back one schedule under a single write lock.
    ///
    /// Concurrent edits of the same schedule are serialized, so none is lost.
    ///
    /// # Errors
    /// Returns an error when the lock cannot be taken, or the read or write fails.
    pub fn update_schedule<F>(
        &mut self,
        user_id: &str,
        semester: &str,
        edit: F,
    ) -> Result<ScheduleEntry>
    where
        F: FnOnce(Option<ScheduleEntry>) -> ScheduleEntry,
    {
        let key = schedule_key(user_id, semester);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to lock schedule {key}"))?;
        let schedule = edit(load_schedule(&tx, &key)?);
        write_schedule(&tx, &schedule)?;
        tx.commit().with_context(|| format!("failed to commit schedule {key}"))?;
        Ok(schedule)
    }

    /// Load every schedule, ordered by storage key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, semester, class_keys_json FROM schedules ORDER BY schedule_key ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut schedules = Vec::new();
        while let Some(row) = rows.next()? {
            let class_keys_json: String = row.get(2)?;
            schedules.push(ScheduleEntry {
                user_id: row.get(0)?,
                semester: row.get(1)?,
                class_keys: serde_json::from_str(&class_keys_json)
                    .context("failed to deserialize schedule class keys")?,
            });
        }
        Ok(schedules)
    }

    /// Append one calendar entry under a fresh store-assigned id.
    ///
    /// Entries are never overwritten; readers see the latest write for a date last.
    ///
    /// # Errors
    /// Returns an error when validation or the write fails.
    pub fn put_calendar_entry(&mut self, entry: &CalendarEntry) -> Result<Ulid> {
        entry.validate().map_err(|err| anyhow!("calendar entry validation failed: {err}"))?;

        let entry_id = Ulid::new();
        self.conn
            .execute(
                "INSERT INTO calendar_entries(
                    entry_id, date, homework, written_at, period, class_name, semester
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry_id.to_string(),
                    entry.date,
                    entry.homework,
                    now_rfc3339()?,
                    entry.period,
                    entry.class_name,
                    entry.semester,
                ],
            )
            .with_context(|| format!("failed to write calendar entry for {}", entry.date))?;
        Ok(entry_id)
    }

    /// Calendar entries for one scope with `from <= date <= to`, ordered by date then write order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn query_calendar(
        &self,
        scope: &CalendarScope,
        from: &str,
        to: &str,
    ) -> Result<Vec<CalendarEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, homework, period, class_name, semester FROM calendar_entries
             WHERE class_name = ?1 AND period = ?2 AND semester = ?3
               AND date >= ?4 AND date <= ?5
             ORDER BY date ASC, seq ASC",
        )?;
        let rows = stmt.query_map(
            params![scope.class_name, scope.period, scope.semester, from, to],
            calendar_entry_from_row,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode calendar row")?);
        }
        Ok(entries)
    }

    /// Load every calendar entry in write order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_calendar_entries(&self) -> Result<Vec<CalendarEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, homework, period, class_name, semester FROM calendar_entries
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], calendar_entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode calendar row")?);
        }
        Ok(entries)
    }

    /// Run quick-check, dangling schedule reference, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let dangling_class_keys = if table_exists(&self.conn, "schedules")? {
            self.dangling_class_keys()?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            dangling_class_keys,
            schema_status,
        })
    }

    fn dangling_class_keys(&self) -> Result<Vec<DanglingClassKey>> {
        let known = self
            .list_classes()?
            .iter()
            .map(ClassRecord::identity_key)
            .collect::<BTreeSet<_>>();

        let mut dangling = Vec::new();
        for schedule in self.list_schedules()? {
            for class_key in &schedule.class_keys {
                if !known.contains(class_key) {
                    dangling.push(DanglingClassKey {
                        schedule_key: schedule.key(),
                        class_key: class_key.clone(),
                    });
                }
            }
        }
        Ok(dangling)
    }

    /// Export classes, schedules and calendar entries as NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let files = vec![
            export_file(out_dir, DocumentKind::Classes, &self.list_classes()?)?,
            export_file(out_dir, DocumentKind::Schedule, &self.list_schedules()?)?,
            export_file(out_dir, DocumentKind::Calendar, &self.list_calendar_entries()?)?,
        ];

        let manifest =
            ExportManifest { schema_version: LATEST_SCHEMA_VERSION, exported_at: now_rfc3339()?, files };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }
}

fn load_schedule(conn: &Connection, key: &str) -> Result<Option<ScheduleEntry>> {
    let row = conn
        .query_row(
            "SELECT user_id, semester, class_keys_json FROM schedules WHERE schedule_key = ?1",
            params![key],
            |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            },
        )
        .optional()
        .with_context(|| format!("failed to load schedule {key}"))?;

    match row {
        Some((user_id, semester, class_keys_json)) => Ok(Some(ScheduleEntry {
            user_id,
            semester,
            class_keys: serde_json::from_str(&class_keys_json)
                .with_context(|| format!("failed to deserialize class keys for {key}"))?,
        })),
        None => Ok(None),
    }
}

fn write_schedule(conn: &Connection, schedule: &ScheduleEntry) -> Result<()> {
    let key = schedule.key();
    conn.execute(
        "INSERT INTO schedules(schedule_key, user_id, semester, class_keys_json)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(schedule_key) DO UPDATE SET
           user_id = excluded.user_id,
           semester = excluded.semester,
           class_keys_json = excluded.class_keys_json",
        params![
            key,
            schedule.user_id,
            schedule.semester,
            serde_json::to_string(&schedule.class_keys).context("failed to serialize class keys")?,
        ],
    )
    .with_context(|| format!("failed to write schedule {key}"))?;
    Ok(())
}

fn class_from_row(row: &Row<'_>) -> rusqlite::Result<ClassRecord> {
    Ok(ClassRecord {
        period: row.get(0)?,
        class_name: row.get(1)?,
        classroom: row.get(2)?,
        semester: row.get(3)?,
    })
}

fn calendar_entry_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarEntry> {
    Ok(CalendarEntry {
        date: row.get(0)?,
        homework: row.get(1)?,
        period: row.get(2)?,
        class_name: row.get(3)?,
        semester: row.get(4)?,
    })
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "calendar_entries")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "calendar_entries", "semester")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn export_file<T: Serialize>(
    out_dir: &Path,
    kind: DocumentKind,
    values: &[T],
) -> Result<ExportFileDigest> {
    let path = format!("{}.ndjson", kind.as_str());
    let (sha256, records) = write_ndjson_file(&out_dir.join(&path), values)?;
    Ok(ExportFileDigest { kind, path, sha256, records })
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

//! In-process stand-in for H2 driver versions, used by unit tests.
//!
//! Databases are SQLite files. Each file is stamped with the version that
//! created it, and a fake driver only opens files of its own storage
//! generation (same major.minor), which is enough to exercise the
//! cross-version fallback logic without a JVM.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::types::ValueRef;
use rusqlite::OpenFlags;

use crate::engine::{
    AccessMode, Connection, Credentials, DatabaseLocator, Engine, EngineLauncher, StatementOutcome,
};
use crate::error::MigrateError;
use crate::metadata::{ColumnInfo, IndexColumnInfo, KeyColumnInfo, MetadataSource, TableInfo, TableRef};
use crate::version::{BuildTags, Locator, VersionRecord};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// How a fake driver version misbehaves
#[derive(Clone, Default)]
pub struct FakeBehavior {
    pub probe_fails: bool,
    pub quirk_fails: bool,
    pub dump_fails: bool,
    /// Runs after a successful dump, e.g. to request cancellation mid-pipeline
    pub after_dump: Option<Callback>,
}

#[derive(Default)]
pub struct FakeLauncher {
    behaviors: Mutex<HashMap<String, FakeBehavior>>,
    events: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, version: &str, behavior: FakeBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(version.to_owned(), behavior);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Engines currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most engines that were ever alive at the same time
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl EngineLauncher for FakeLauncher {
    fn launch(&self, record: &VersionRecord, _artifact: &Path) -> Result<Box<dyn Engine>, MigrateError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&record.version_string())
            .cloned()
            .unwrap_or_default();

        push(&self.events, format!("launch {}", record.version_string()));
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeEngine {
            record: record.clone(),
            behavior,
            events: self.events.clone(),
            live: self.live.clone(),
        }))
    }
}

fn push(events: &Arc<Mutex<Vec<String>>>, event: String) {
    events.lock().unwrap().push(event);
}

/// Storage stamp of a version; files are readable within one major.minor
fn stamp(record: &VersionRecord) -> i64 {
    i64::from(record.major()) * 1_000_000 + i64::from(record.minor()) * 1_000 + i64::from(record.patch())
}

fn generation(stamp: i64) -> i64 {
    stamp / 1_000
}

pub struct FakeEngine {
    record: VersionRecord,
    behavior: FakeBehavior,
    events: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
}

impl FakeEngine {
    fn open(&self, file: &Path, access: AccessMode, must_exist: bool) -> Result<rusqlite::Connection, MigrateError> {
        if must_exist && !file.is_file() {
            return Err(MigrateError::Engine(format!(
                "Database {} not found",
                file.display()
            )));
        }

        let conn = match access {
            AccessMode::ReadOnly => rusqlite::Connection::open_with_flags(file, OpenFlags::SQLITE_OPEN_READ_ONLY),
            AccessMode::ReadWrite => rusqlite::Connection::open(file),
        }
        .map_err(engine_error)?;

        let written_by: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(engine_error)?;

        if written_by == 0 {
            if access == AccessMode::ReadWrite {
                conn.pragma_update(None, "user_version", stamp(&self.record))
                    .map_err(engine_error)?;
            }
        } else if generation(written_by) != generation(stamp(&self.record)) {
            return Err(MigrateError::Engine(format!(
                "Unsupported database file version {} in {}",
                written_by,
                file.display()
            )));
        }

        Ok(conn)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine for FakeEngine {
    fn reported_version(&mut self) -> Result<String, MigrateError> {
        if self.behavior.probe_fails {
            return Err(MigrateError::Engine("corrupt driver".into()));
        }
        Ok(self.record.version_string())
    }

    fn force_resolve(&mut self, symbols: &[String]) -> Result<(), MigrateError> {
        if self.behavior.quirk_fails {
            return Err(MigrateError::Engine("ClassNotFoundException".into()));
        }
        push(
            &self.events,
            format!("force_resolve {} {}", self.record.version_string(), symbols.len()),
        );
        Ok(())
    }

    fn connect<'a>(
        &'a mut self,
        locator: &DatabaseLocator,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Connection + 'a>, MigrateError> {
        let file = locator.storage_file();
        let conn = self.open(&file, locator.access, locator.must_exist)?;
        push(
            &self.events,
            format!(
                "connect {} {}",
                self.record.version_string(),
                file.file_name().unwrap().to_string_lossy()
            ),
        );
        Ok(Box::new(FakeConnection {
            conn,
            version: self.record.version_string(),
            behavior: self.behavior.clone(),
            events: self.events.clone(),
        }))
    }

    fn recover(&mut self, folder: &Path, database_name: &str) -> Result<(), MigrateError> {
        for suffix in [".mv", ".h2"] {
            let file = folder.join(format!("{database_name}{suffix}.db"));
            if file.is_file() {
                let conn = self.open(&file, AccessMode::ReadOnly, true)?;
                let script = folder.join(format!("{database_name}{suffix}.sql"));
                fs::write(script, dump(&conn)?)?;
                push(&self.events, format!("recover {}", self.record.version_string()));
                return Ok(());
            }
        }
        Err(MigrateError::Engine(format!("No database {database_name} in {}", folder.display())))
    }

    fn shutdown(&mut self) {
        push(&self.events, format!("shutdown {}", self.record.version_string()));
    }
}

pub struct FakeConnection {
    conn: rusqlite::Connection,
    version: String,
    behavior: FakeBehavior,
    events: Arc<Mutex<Vec<String>>>,
}

fn engine_error(e: rusqlite::Error) -> MigrateError {
    MigrateError::Engine(e.to_string())
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(hex::encode(b)),
    }
}

fn query(conn: &rusqlite::Connection, sql: &str) -> Result<StatementOutcome, MigrateError> {
    let mut stmt = conn.prepare(sql).map_err(engine_error)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let count = columns.len();
    let rows = stmt
        .query_map([], |row| {
            (0..count)
                .map(|i| row.get_ref(i).map(value_text))
                .collect::<Result<Vec<_>, _>>()
        })
        .map_err(engine_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(engine_error)?;
    Ok(StatementOutcome::Rows { columns, rows })
}

/// Schema and data of a database as a replayable script
fn dump(conn: &rusqlite::Connection) -> Result<String, MigrateError> {
    let objects = query(
        conn,
        "SELECT type, name, sql FROM sqlite_master WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
         ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, rowid",
    )?;

    let mut script = String::new();
    let mut tables = Vec::new();
    for row in objects.rows() {
        let (kind, name, sql) = (row[0].clone().unwrap_or_default(), row[1].clone().unwrap_or_default(), row[2].clone().unwrap_or_default());
        script.push_str(&sql);
        script.push_str(";\n");
        if kind == "table" {
            tables.push(name);
        }
    }

    for table in tables {
        let columns = query(conn, &format!("SELECT name FROM pragma_table_info('{table}')"))?.first_column();
        let values = columns
            .iter()
            .map(|c| format!("quote(\"{c}\")"))
            .collect::<Vec<_>>()
            .join(" || ',' || ");
        let rows = query(conn, &format!("SELECT {values} FROM \"{table}\""))?.first_column();
        for row in rows {
            script.push_str(&format!("INSERT INTO \"{table}\" VALUES ({row});\n"));
        }
    }

    Ok(script)
}

fn script_target(sql: &str) -> Option<PathBuf> {
    let rest = sql.trim().strip_prefix("SCRIPT TO '")?;
    let end = rest.find('\'')?;
    Some(PathBuf::from(&rest[..end]))
}

impl Connection for FakeConnection {
    fn execute(&mut self, sql: &str) -> Result<StatementOutcome, MigrateError> {
        // SQLite has no PUBLIC schema
        let sql = &sql.replace("\"PUBLIC\".", "");
        if let Some(target) = script_target(sql) {
            push(&self.events, format!("script_to {}", self.version));
            fs::write(target, dump(&self.conn)?)?;
            return Ok(StatementOutcome::Updated(0));
        }

        let keyword = sql.trim_start().to_ascii_uppercase();
        if keyword.starts_with("SELECT") || keyword.starts_with("WITH") || keyword.starts_with("VALUES") {
            query(&self.conn, sql)
        } else {
            self.conn.execute_batch(sql).map_err(engine_error)?;
            push(&self.events, format!("execute {} {}", self.version, sql.trim()));
            Ok(StatementOutcome::Updated(self.conn.changes()))
        }
    }

    fn dump_script(&mut self, script: &Path, options: &str) -> Result<(), MigrateError> {
        if self.behavior.dump_fails {
            return Err(MigrateError::Engine("General error: java.lang.IllegalStateException".into()));
        }
        push(&self.events, format!("dump {} {}", self.version, options));
        fs::write(script, dump(&self.conn)?)?;
        if let Some(callback) = &self.behavior.after_dump {
            callback();
        }
        Ok(())
    }

    fn run_script(&mut self, script: &Path, options: &str) -> Result<(), MigrateError> {
        push(&self.events, format!("runscript {} {}", self.version, options));
        let text = fs::read_to_string(script)?;
        self.conn.execute_batch(&text).map_err(engine_error)
    }

    fn analyze(&mut self) -> Result<(), MigrateError> {
        push(&self.events, format!("analyze {}", self.version));
        self.conn.execute_batch("ANALYZE").map_err(engine_error)
    }

    fn compact(&mut self) -> Result<(), MigrateError> {
        push(&self.events, format!("compact {}", self.version));
        self.conn.execute_batch("VACUUM").map_err(engine_error)
    }
}

impl MetadataSource for FakeConnection {
    fn catalogs(&mut self) -> Result<Vec<String>, MigrateError> {
        Ok(vec!["FAKE".into()])
    }

    fn schemas(&mut self, _catalog: &str) -> Result<Vec<String>, MigrateError> {
        Ok(vec!["PUBLIC".into()])
    }

    fn tables(&mut self, _catalog: &str, _schema: &str) -> Result<Vec<TableInfo>, MigrateError> {
        let rows = query(
            &self.conn,
            "SELECT name, type FROM sqlite_master WHERE type IN ('table', 'view') \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        Ok(rows
            .rows()
            .iter()
            .map(|r| TableInfo {
                name: r[0].clone().unwrap_or_default(),
                table_type: r[1].clone().unwrap_or_default().to_ascii_uppercase(),
                remarks: None,
            })
            .collect())
    }

    fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>, MigrateError> {
        let rows = query(
            &self.conn,
            &format!("SELECT cid, name, type, \"notnull\", dflt_value FROM pragma_table_info('{}')", table.name),
        )?;
        Ok(rows
            .rows()
            .iter()
            .map(|r| {
                let declared = r[2].clone().unwrap_or_default();
                let (type_name, precision, scale) = split_declared_type(&declared);
                ColumnInfo {
                    name: r[1].clone().unwrap_or_default(),
                    ordinal: r[0].as_deref().unwrap_or("0").parse::<u32>().unwrap() + 1,
                    type_name,
                    precision,
                    scale,
                    nullable: r[3].as_deref() == Some("0"),
                    default: r[4].clone(),
                }
            })
            .collect())
    }

    fn index_columns(&mut self, table: &TableRef) -> Result<Vec<IndexColumnInfo>, MigrateError> {
        let indexes = query(
            &self.conn,
            &format!("SELECT name, \"unique\" FROM pragma_index_list('{}') WHERE origin <> 'pk'", table.name),
        )?;
        let mut result = Vec::new();
        for index in indexes.rows() {
            let name = index[0].clone().unwrap_or_default();
            let columns = query(
                &self.conn,
                &format!("SELECT seqno, name FROM pragma_index_info('{name}') ORDER BY seqno"),
            )?;
            for column in columns.rows() {
                result.push(IndexColumnInfo {
                    index_name: name.clone(),
                    non_unique: index[1].as_deref() == Some("0"),
                    ordinal: column[0].as_deref().unwrap_or("0").parse::<u32>().unwrap() + 1,
                    column_name: column[1].clone().unwrap_or_default(),
                    ascending: Some(true),
                });
            }
        }
        Ok(result)
    }

    fn primary_key(&mut self, table: &TableRef) -> Result<Vec<KeyColumnInfo>, MigrateError> {
        let rows = query(
            &self.conn,
            &format!("SELECT pk, name FROM pragma_table_info('{}') WHERE pk > 0 ORDER BY pk", table.name),
        )?;
        Ok(rows
            .rows()
            .iter()
            .map(|r| KeyColumnInfo {
                key_name: format!("PK_{}", table.name.to_uppercase()),
                ordinal: r[0].as_deref().unwrap_or("0").parse().unwrap(),
                column_name: r[1].clone().unwrap_or_default(),
            })
            .collect())
    }
}

/// `DECIMAL(200,2)` → (`DECIMAL`, 200, 2)
fn split_declared_type(declared: &str) -> (String, Option<u64>, Option<u64>) {
    match declared.split_once('(') {
        Some((name, args)) => {
            let mut numbers = args
                .trim_end_matches(')')
                .split(',')
                .map(|n| n.trim().parse::<u64>().ok());
            (
                name.trim().to_ascii_uppercase(),
                numbers.next().flatten(),
                numbers.next().flatten(),
            )
        }
        None => (declared.trim().to_ascii_uppercase(), None, None),
    }
}

// ==================================================================================
// Fixtures
// ==================================================================================

/// Writes an empty driver jar into `dir` and returns its record
pub fn driver(dir: &Path, version: &str) -> VersionRecord {
    let name = format!("h2-{version}.jar");
    let path = dir.join(&name);
    fs::write(&path, b"jar").unwrap();
    VersionRecord::from_artifact_name(&name, Locator::File(path), &BuildTags::default()).unwrap()
}

/// Creates `<base>.mv.db` as if written by `version`, with two tables
pub fn create_database(base: &Path, version: &VersionRecord) -> PathBuf {
    let file = PathBuf::from(format!("{}.mv.db", base.display()));
    let conn = rusqlite::Connection::open(&file).unwrap();
    conn.execute_batch(
        "CREATE TABLE customer (id INTEGER PRIMARY KEY, name VARCHAR(100) NOT NULL, balance DECIMAL(20,2));
         CREATE INDEX idx_customer_name ON customer (name);
         CREATE TABLE invoice (id INTEGER PRIMARY KEY, customer_id INTEGER, total DECIMAL(65535,32767));
         CREATE VIEW big_invoices AS SELECT * FROM invoice WHERE total > 1000;
         INSERT INTO customer VALUES (1, 'Ada', 12.5), (2, 'Grace', 1000.25);
         INSERT INTO invoice VALUES (10, 1, 123456.789), (11, 2, 42);",
    )
    .unwrap();
    conn.pragma_update(None, "user_version", stamp(version)).unwrap();
    file
}

/// Table names and column counts of a database file
pub fn table_shapes(file: &Path) -> Vec<(String, Vec<String>)> {
    let conn = rusqlite::Connection::open_with_flags(file, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
    let tables = query(&conn, "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap()
        .first_column();
    tables
        .into_iter()
        .map(|t| {
            let columns = query(&conn, &format!("SELECT name FROM pragma_table_info('{t}')"))
                .unwrap()
                .first_column();
            (t, columns)
        })
        .collect()
}

/// The version stamp stored in a fake database file
pub fn written_by(file: &Path) -> i64 {
    let conn = rusqlite::Connection::open_with_flags(file, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
    conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap()
}

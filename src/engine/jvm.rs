//! Runs H2 driver versions in short-lived child JVMs.
//!
//! Every engine call starts `java -cp <driver jar> <tool>` and waits for it,
//! so each call gets a class path holding exactly one driver version plus the
//! platform runtime. A misbehaving old driver can't touch this process or any
//! other version's state.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace};

use super::csv;
use super::dialect::{self, MetadataDialect};
use super::process::{run_tool, ToolOutput};
use super::{
    sql_literal, AccessMode, Connection, Credentials, DatabaseLocator, Engine, EngineLauncher,
    StatementOutcome,
};
use crate::error::MigrateError;
use crate::metadata::{ColumnInfo, IndexColumnInfo, KeyColumnInfo, MetadataSource, TableInfo, TableRef};
use crate::paths::StorageKind;
use crate::version::VersionRecord;

const SHELL_TOOL: &str = "org.h2.tools.Shell";
const SCRIPT_TOOL: &str = "org.h2.tools.Script";
const RECOVER_TOOL: &str = "org.h2.tools.Recover";
const MEMORY_URL: &str = "jdbc:h2:mem:";

/// Result files written by CSVWRITE get unique names within this process
static RESULT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Starts [`JvmEngine`]s with a configured Java runtime
#[derive(Debug, Clone)]
pub struct JvmLauncher {
    java: PathBuf,
    timeout: Option<Duration>,
    work_dir: PathBuf,
}

impl JvmLauncher {
    /// `work_dir` receives temporary result files; `timeout` bounds every tool call.
    pub fn new(java: PathBuf, timeout: Option<Duration>, work_dir: PathBuf) -> Self {
        JvmLauncher {
            java,
            timeout,
            work_dir,
        }
    }
}

impl EngineLauncher for JvmLauncher {
    fn launch(&self, record: &VersionRecord, artifact: &Path) -> Result<Box<dyn Engine>, MigrateError> {
        if !artifact.is_file() {
            return Err(MigrateError::Load {
                version: record.version_string(),
                reason: format!("driver {} is not a file", artifact.display()),
            });
        }
        fs::create_dir_all(&self.work_dir)?;

        Ok(Box::new(JvmEngine {
            record: record.clone(),
            java: self.java.clone(),
            class_path: artifact.to_path_buf(),
            timeout: self.timeout,
            work_dir: self.work_dir.clone(),
            dialect: MetadataDialect::for_version(record),
        }))
    }
}

pub struct JvmEngine {
    record: VersionRecord,
    java: PathBuf,
    class_path: PathBuf,
    timeout: Option<Duration>,
    work_dir: PathBuf,
    dialect: MetadataDialect,
}

impl JvmEngine {
    fn tool_command(&self, tool: &str) -> Command {
        let mut command = Command::new(&self.java);
        command.arg("-cp").arg(&self.class_path).arg(tool);
        command
    }

    /// Builds the JDBC URL for a locator, adding the settings this driver
    /// version needs for the storage format found on disk.
    fn url(&self, locator: &DatabaseLocator) -> String {
        let mut url = format!("jdbc:h2:{}", locator.base.display());
        if locator.storage == StorageKind::PageStore && self.record.storage_kind() == StorageKind::MvStore {
            url.push_str(";MV_STORE=FALSE");
        }
        if locator.must_exist {
            url.push_str(";IFEXISTS=TRUE");
        }
        if locator.access == AccessMode::ReadOnly {
            url.push_str(";ACCESS_MODE_DATA=r");
        }
        url.push_str(&locator.extra_params());
        url
    }

    fn run(&self, command: Command) -> Result<ToolOutput, MigrateError> {
        let output = run_tool(command, self.timeout)?;
        trace!("{} stdout:\n{}", self.record, output.stdout);
        Ok(output)
    }

    /// Runs statements through the H2 shell. The shell reports SQL errors on
    /// stdout and still exits with 0, so both are checked.
    fn shell(&self, url: &str, credentials: &Credentials, sql: &str) -> Result<String, MigrateError> {
        let mut command = self.tool_command(SHELL_TOOL);
        command
            .arg("-url")
            .arg(url)
            .arg("-user")
            .arg(&credentials.user)
            .arg("-password")
            .arg(&credentials.password)
            .arg("-sql")
            .arg(sql);

        let output = self.run(command)?;
        check_tool_output(&output)?;
        Ok(output.stdout)
    }

    /// Runs a query and returns all rows, untruncated, by letting the engine
    /// write them to a CSV file.
    fn query(&self, url: &str, credentials: &Credentials, sql: &str) -> Result<StatementOutcome, MigrateError> {
        let result_file = self.work_dir.join(format!(
            "result-{}-{}.csv",
            std::process::id(),
            RESULT_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let statement = format!(
            "CALL CSVWRITE({}, {}, {})",
            sql_literal(&result_file.to_string_lossy()),
            sql_literal(sql),
            sql_literal(&format!("charset=UTF-8 null={}", csv::NULL_MARKER))
        );
        let shell_result = self.shell(url, credentials, &statement);

        let text = shell_result.and_then(|_| fs::read_to_string(&result_file).map_err(MigrateError::from));
        let _ = fs::remove_file(&result_file);

        let mut rows = csv::parse(&text?).into_iter();
        let columns = rows
            .next()
            .map(|header| header.into_iter().map(Option::unwrap_or_default).collect())
            .unwrap_or_default();

        Ok(StatementOutcome::Rows {
            columns,
            rows: rows.collect(),
        })
    }
}

impl Engine for JvmEngine {
    fn reported_version(&mut self) -> Result<String, MigrateError> {
        let outcome = self.query(MEMORY_URL, &Credentials::default(), "SELECT H2VERSION()")?;
        outcome
            .first_column()
            .into_iter()
            .next()
            .ok_or_else(|| MigrateError::Engine("H2VERSION() returned no rows".into()))
    }

    fn force_resolve(&mut self, symbols: &[String]) -> Result<(), MigrateError> {
        if symbols.is_empty() {
            return Ok(());
        }

        let mut sql =
            String::from("CREATE ALIAS FORCE_LOAD FOR \"java.lang.Class.forName(java.lang.String)\";");
        for symbol in symbols {
            sql.push_str(&format!(" CALL FORCE_LOAD({});", sql_literal(symbol)));
        }

        self.shell(MEMORY_URL, &Credentials::default(), &sql).map(|_| ())
    }

    fn connect<'a>(
        &'a mut self,
        locator: &DatabaseLocator,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection + 'a>, MigrateError> {
        let url = self.url(locator);
        debug!("{} connecting to {}", self.record, url);

        // Opening the database is the first thing that fails when a driver
        // can't read the storage format, so fail here rather than later.
        self.shell(&url, credentials, "SELECT 1")?;

        Ok(Box::new(JvmConnection {
            engine: self,
            url,
            credentials: credentials.clone(),
        }))
    }

    fn recover(&mut self, folder: &Path, database_name: &str) -> Result<(), MigrateError> {
        let mut command = self.tool_command(RECOVER_TOOL);
        command.arg("-dir").arg(folder).arg("-db").arg(database_name);

        let output = self.run(command)?;
        check_tool_output(&output)
    }

    fn shutdown(&mut self) {
        // Nothing stays resident between calls
        debug!("{} released", self.record);
    }
}

pub struct JvmConnection<'a> {
    engine: &'a JvmEngine,
    url: String,
    credentials: Credentials,
}

impl JvmConnection<'_> {
    fn rows(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, MigrateError> {
        match self.engine.query(&self.url, &self.credentials, sql)? {
            StatementOutcome::Rows { rows, .. } => Ok(rows),
            StatementOutcome::Updated(_) => Ok(Vec::new()),
        }
    }
}

impl Connection for JvmConnection<'_> {
    fn execute(&mut self, sql: &str) -> Result<StatementOutcome, MigrateError> {
        if returns_rows(sql) {
            self.engine.query(&self.url, &self.credentials, sql)
        } else {
            let stdout = self.engine.shell(&self.url, &self.credentials, sql)?;
            Ok(StatementOutcome::Updated(parse_update_count(&stdout)))
        }
    }

    fn dump_script(&mut self, script: &Path, options: &str) -> Result<(), MigrateError> {
        let mut command = self.engine.tool_command(SCRIPT_TOOL);
        command
            .arg("-url")
            .arg(&self.url)
            .arg("-user")
            .arg(&self.credentials.user)
            .arg("-password")
            .arg(&self.credentials.password)
            .arg("-script")
            .arg(script);
        if !options.trim().is_empty() {
            command.arg("-options").args(options.split_whitespace());
        }

        let output = self.engine.run(command)?;
        check_tool_output(&output)
    }

    fn run_script(&mut self, script: &Path, options: &str) -> Result<(), MigrateError> {
        let sql = format!(
            "RUNSCRIPT FROM {} {}",
            sql_literal(&script.to_string_lossy()),
            options
        );
        self.engine
            .shell(&self.url, &self.credentials, sql.trim_end())
            .map(|_| ())
    }

    fn analyze(&mut self) -> Result<(), MigrateError> {
        self.engine
            .shell(&self.url, &self.credentials, "ANALYZE SAMPLE_SIZE 0")
            .map(|_| ())
    }

    fn compact(&mut self) -> Result<(), MigrateError> {
        self.engine
            .shell(&self.url, &self.credentials, "SHUTDOWN COMPACT")
            .map(|_| ())
    }
}

impl MetadataSource for JvmConnection<'_> {
    fn catalogs(&mut self) -> Result<Vec<String>, MigrateError> {
        dialect::to_names(&self.rows(&self.engine.dialect.catalogs_sql())?)
    }

    fn schemas(&mut self, catalog: &str) -> Result<Vec<String>, MigrateError> {
        dialect::to_names(&self.rows(&self.engine.dialect.schemas_sql(catalog))?)
    }

    fn tables(&mut self, catalog: &str, schema: &str) -> Result<Vec<TableInfo>, MigrateError> {
        let rows = self.rows(&self.engine.dialect.tables_sql(catalog, schema))?;
        self.engine.dialect.to_tables(schema, &rows)
    }

    fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>, MigrateError> {
        dialect::to_columns(&self.rows(&self.engine.dialect.columns_sql(table))?)
    }

    fn index_columns(&mut self, table: &TableRef) -> Result<Vec<IndexColumnInfo>, MigrateError> {
        dialect::to_index_columns(&self.rows(&self.engine.dialect.index_columns_sql(table))?)
    }

    fn primary_key(&mut self, table: &TableRef) -> Result<Vec<KeyColumnInfo>, MigrateError> {
        dialect::to_key_columns(&self.rows(&self.engine.dialect.primary_key_sql(table))?)
    }
}

/// Statements whose result set is needed; everything else runs as an update.
fn returns_rows(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .trim_start_matches('(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "VALUES" | "TABLE" | "SHOW" | "EXPLAIN" | "CALL"
    )
}

/// Fails on a non-zero exit or on an `Error:` line printed by the tool.
fn check_tool_output(output: &ToolOutput) -> Result<(), MigrateError> {
    if let Some(message) = output
        .stdout
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("Error: "))
    {
        return Err(MigrateError::Engine(message.trim().to_owned()));
    }

    if !output.status.success() {
        let detail = first_exception_line(&output.stderr)
            .or_else(|| first_exception_line(&output.stdout))
            .unwrap_or_else(|| format!("exit status {}", output.status));
        return Err(MigrateError::Engine(detail));
    }

    Ok(())
}

fn first_exception_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("at "))
        .map(str::to_owned)
}

/// Reads `(Update count: 3, 12 ms)` from shell output
fn parse_update_count(stdout: &str) -> u64 {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("(Update count: "))
        .filter_map(|rest| rest.split(',').next())
        .filter_map(|count| count.trim().parse::<u64>().ok())
        .sum()
}

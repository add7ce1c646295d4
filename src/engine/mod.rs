//! The capability surface of one loaded H2 driver version.
//!
//! Everything the migration pipeline does against a database goes through the
//! [`Engine`] and [`Connection`] traits. An [`EngineLauncher`] creates a fresh
//! engine for a driver artifact; each engine owns its own isolation boundary
//! and releases it when dropped.

mod csv;
mod dialect;
mod jvm;
mod process;

pub use jvm::JvmLauncher;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::MigrateError;
use crate::metadata::MetadataSource;
use crate::paths::StorageKind;
use crate::version::VersionRecord;

/// Login for a database. The password is never printed.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Identifies a database for a connection: the path without storage suffix,
/// the storage format found (or to be created) on disk and extra URL settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLocator {
    pub base: PathBuf,
    pub storage: StorageKind,
    pub access: AccessMode,
    /// Fail instead of creating an empty database when the file is missing
    pub must_exist: bool,
    /// Additional `;KEY=VALUE` settings supplied by the user
    pub params: String,
}

impl DatabaseLocator {
    /// An existing database that is read and dumped
    pub fn source(base: &Path, storage: StorageKind, access: AccessMode, params: &str) -> Self {
        DatabaseLocator {
            base: base.to_path_buf(),
            storage,
            access,
            must_exist: true,
            params: params.to_owned(),
        }
    }

    /// A database that is created by a rebuild
    pub fn target(base: &Path, storage: StorageKind, params: &str) -> Self {
        DatabaseLocator {
            base: base.to_path_buf(),
            storage,
            access: AccessMode::ReadWrite,
            must_exist: false,
            params: params.to_owned(),
        }
    }

    pub fn storage_file(&self) -> PathBuf {
        self.storage.storage_file(&self.base)
    }

    /// The user's settings, normalized to start with `;`
    pub fn extra_params(&self) -> String {
        let params = self.params.trim();
        if params.is_empty() || params.starts_with(';') {
            params.to_owned()
        } else {
            format!(";{params}")
        }
    }
}

/// What a statement produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    Updated(u64),
}

impl StatementOutcome {
    /// The non-null values of the first column, or nothing for updates
    pub fn first_column(&self) -> Vec<String> {
        match self {
            StatementOutcome::Rows { rows, .. } => rows
                .iter()
                .filter_map(|row| row.first().cloned().flatten())
                .collect(),
            StatementOutcome::Updated(_) => Vec::new(),
        }
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        match self {
            StatementOutcome::Rows { rows, .. } => rows,
            StatementOutcome::Updated(_) => &[],
        }
    }
}

/// Creates engines for driver artifacts. Shared between batch workers.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, record: &VersionRecord, artifact: &Path) -> Result<Box<dyn Engine>, MigrateError>;
}

/// One loaded driver version.
pub trait Engine {
    /// Opens a throwaway in-memory database and returns the version the
    /// driver reports about itself.
    fn reported_version(&mut self) -> Result<String, MigrateError>;

    /// Forces the given internal classes to be resolved right away.
    fn force_resolve(&mut self, symbols: &[String]) -> Result<(), MigrateError>;

    fn connect<'a>(
        &'a mut self,
        locator: &DatabaseLocator,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection + 'a>, MigrateError>;

    /// Runs the driver's recovery tool for database `database_name` (without
    /// storage suffix) in `folder`. The tool writes its script next to it.
    fn recover(&mut self, folder: &Path, database_name: &str) -> Result<(), MigrateError>;

    /// Tears down the isolation boundary. Called once when the handle is released.
    fn shutdown(&mut self) {}
}

/// A live connection opened by an [`Engine`]
pub trait Connection: MetadataSource {
    fn execute(&mut self, sql: &str) -> Result<StatementOutcome, MigrateError>;

    /// Dumps the database with the driver's own script tool
    fn dump_script(&mut self, script: &Path, options: &str) -> Result<(), MigrateError>;

    /// Rebuilds the database from a script (`RUNSCRIPT`)
    fn run_script(&mut self, script: &Path, options: &str) -> Result<(), MigrateError>;

    /// Integrity and statistics pass
    fn analyze(&mut self) -> Result<(), MigrateError>;

    /// Compacts the storage file and closes the database
    fn compact(&mut self) -> Result<(), MigrateError>;
}

/// Quotes text as an SQL string literal
pub fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Quotes an SQL identifier
pub fn sql_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Splits a script into its statements on `;`, ignoring semicolons inside
/// string literals, quoted identifiers, comments and `$$` blocks. Comments
/// are dropped; empty statements are skipped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                current.push(c);
                // A doubled quote is an escaped quote and keeps the literal open
                while let Some(inner) = chars.next() {
                    current.push(inner);
                    if inner == c {
                        if chars.peek() == Some(&c) {
                            current.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '$' if chars.peek() == Some(&'$') => {
                chars.next();
                current.push_str("$$");
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    current.push(inner);
                    if previous == '$' && inner == '$' {
                        break;
                    }
                    previous = inner;
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
                current.push(' ');
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &mut current);

    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_owned());
    }
    current.clear();
}

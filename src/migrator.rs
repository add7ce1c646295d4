use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;
use strum::{AsRefStr, Display};

use crate::batch::{self, BatchReport};
use crate::engine::{sql_literal, AccessMode, Credentials, DatabaseLocator};
use crate::error::MigrateError;
use crate::hooks::{HookSet, HookStage};
use crate::loader::IsolationLoader;
use crate::paths::{
    native_files_in, script_options, script_path_for, target_base, Compression, SourceKind, StorageKind,
};
use crate::registry::Registry;
use crate::verify::{self, Recommendation, DEFAULT_DECIMAL_THRESHOLD};
use crate::version::VersionRecord;

/// States of one migration. `Failed` is reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Idle,
    ResolveVersions,
    Export,
    Import,
    Finalize,
    Done,
    Failed,
}

/// Everything a caller can ask of a migration
#[derive(Debug, Clone, Default)]
pub struct MigrationRequest {
    /// Version spec of the reader; `None` lets auto mode search for one
    pub from: Option<String>,
    /// Version spec of the writer; `None` means the newest registered version
    pub to: Option<String>,
    /// A native database file, a script, or (auto mode) a directory
    pub source: PathBuf,
    pub credentials: Credentials,
    /// Where the dump goes; defaults to `<dbname>.sql` next to the database
    pub script: Option<PathBuf>,
    pub compression: Compression,
    /// Dialect and upgrade options passed to `RUNSCRIPT`, e.g. `FROM_1X`
    pub upgrade_options: String,
    /// Extra `;KEY=VALUE` connection settings
    pub connection_params: String,
    pub overwrite: bool,
    pub force: bool,
    pub verify: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub source: PathBuf,
    pub script_path: PathBuf,
    /// The rebuilt storage file; absent for recovery
    pub database_path: Option<PathBuf>,
    /// Absent when the migration started from a script
    pub from_version: Option<String>,
    /// Absent for recovery
    pub to_version: Option<String>,
    /// IMPORT and INIT commands replayed on the target, in replay order
    pub commands: Vec<String>,
    pub stage: Stage,
    pub recommendations: Vec<Recommendation>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum AutoOutcome {
    Single(MigrationResult),
    Batch(BatchReport),
}

/// What an export produced
struct Exported {
    script: PathBuf,
    commands: Vec<String>,
    recommendations: Vec<Recommendation>,
}

impl Exported {
    /// A script given as the source needs no export
    fn from_script(path: &Path) -> Self {
        Exported {
            script: path.to_path_buf(),
            commands: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// Runs migrations against a fixed registry. Cheap to clone; clones share the
/// registry, loader and interrupt token.
#[derive(Clone)]
pub struct Migrator {
    registry: Arc<Registry>,
    loader: Arc<IsolationLoader>,
    hooks_dir: Option<PathBuf>,
    interrupt_token: Arc<AtomicBool>,
    decimal_threshold: u64,
    batch_threads: usize,
}

impl Migrator {
    pub fn new(registry: Arc<Registry>, loader: Arc<IsolationLoader>) -> Self {
        Migrator {
            registry,
            loader,
            hooks_dir: None,
            interrupt_token: Arc::new(AtomicBool::new(false)),
            decimal_threshold: DEFAULT_DECIMAL_THRESHOLD,
            batch_threads: 1,
        }
    }

    pub fn with_hooks_dir(mut self, hooks_dir: Option<PathBuf>) -> Self {
        self.hooks_dir = hooks_dir;
        self
    }

    pub fn with_interrupt_token(mut self, interrupt_token: Arc<AtomicBool>) -> Self {
        self.interrupt_token = interrupt_token;
        self
    }

    pub fn with_decimal_threshold(mut self, threshold: u64) -> Self {
        self.decimal_threshold = threshold;
        self
    }

    pub fn with_batch_threads(mut self, threads: usize) -> Self {
        self.batch_threads = threads.max(1);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn interrupt_token(&self) -> &Arc<AtomicBool> {
        &self.interrupt_token
    }

    pub fn check_interrupted(&self) -> Result<(), MigrateError> {
        if self.interrupt_token.load(Ordering::Acquire) {
            Err(MigrateError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Migrates one database, or a script, with explicit versions. A native
    /// source needs `from`; a script source starts at the import.
    pub fn migrate(&self, request: &MigrationRequest) -> Result<MigrationResult, MigrateError> {
        let _tmr = timer!(Level::Info; "Migrator.migrate", "{}", request.source.display());

        self.enter(Stage::ResolveVersions, &request.source)?;
        let source = SourceKind::classify(&request.source)?;
        let to = self.resolve_to(request)?;

        let (from, exported) = match &source {
            SourceKind::Native { base, storage } => {
                let spec = request.from.as_deref().ok_or_else(|| {
                    MigrateError::Resolution("Migrating a database needs a source version, or auto mode".into())
                })?;
                let from = self.registry.resolve(spec)?;
                (Some(from), self.export(from, base, *storage, request)?)
            }
            SourceKind::Script { path, .. } => (None, Exported::from_script(path)),
        };

        self.import_and_finalize(request, &source, from, to, exported)
    }

    /// Migrates without a declared reader version. A directory source
    /// migrates every native database directly inside it.
    pub fn migrate_auto(&self, request: &MigrationRequest) -> Result<AutoOutcome, MigrateError> {
        if request.source.is_dir() {
            let files = native_files_in(&request.source)?;
            info!(
                "Migrating {} databases in {}",
                files.len(),
                request.source.display()
            );
            let report = batch::run(self, files, request, self.batch_threads)?;
            return if report.failed.is_empty() {
                Ok(AutoOutcome::Batch(report))
            } else {
                Err(MigrateError::Batch(report))
            };
        }

        self.migrate_file_auto(request).map(AutoOutcome::Single)
    }

    /// Auto mode for a single file: the first version, newest first, that
    /// manages to export the database is used as the reader.
    pub(crate) fn migrate_file_auto(&self, request: &MigrationRequest) -> Result<MigrationResult, MigrateError> {
        let _tmr = timer!(Level::Info; "Migrator.migrate_auto", "{}", request.source.display());

        self.enter(Stage::ResolveVersions, &request.source)?;
        let source = SourceKind::classify(&request.source)?;
        let to = self.resolve_to(request)?;

        let (base, storage) = match &source {
            SourceKind::Native { base, storage } => (base, *storage),
            SourceKind::Script { path, .. } => {
                return self.import_and_finalize(request, &source, None, to, Exported::from_script(path));
            }
        };

        let mut tried = Vec::new();
        for candidate in self.registry.descending() {
            match self.export(candidate, base, storage, request) {
                Ok(exported) => {
                    info!("{} can read {}", candidate, request.source.display());
                    return self.import_and_finalize(request, &source, Some(candidate), to, exported);
                }
                Err(e @ (MigrateError::Interrupted | MigrateError::Verification(_))) => return Err(e),
                Err(e) => {
                    warn!("Exporting with {} failed, trying an older version: {}", candidate, e);
                    tried.push(candidate.version_string());
                }
            }
        }

        Err(MigrateError::NoCompatibleReader {
            path: request.source.clone(),
            tried,
        })
    }

    /// Runs the recovery tool of `record` on `database_name` (a `*.mv.db` or
    /// `*.h2.db` file in `folder`). The tool writes `<name>.mv.sql` or
    /// `<name>.h2.sql` next to the database.
    pub fn recover(
        &self,
        record: &VersionRecord,
        folder: &Path,
        database_name: &str,
    ) -> Result<MigrationResult, MigrateError> {
        let _tmr = timer!(Level::Info; "Migrator.recover", "{}", database_name);
        let database_file = folder.join(database_name);

        let storage = StorageKind::from_file_name(database_name)
            .ok_or_else(|| MigrateError::UnsupportedSource(database_file.clone()))?;
        let name = &database_name[..database_name.len() - storage.suffix().len()];
        let script_name = format!("{}{}", &database_name[..database_name.len() - ".db".len()], ".sql");
        let script_path = folder.join(script_name);

        self.enter(Stage::Export, &database_file)?;
        let mut handle = self
            .loader
            .load(record)
            .map_err(|e| e.in_stage(Stage::Export, &record.version_string(), &database_file))?;
        handle
            .recover(folder, name)
            .map_err(|e| e.in_stage(Stage::Export, &record.version_string(), &database_file))?;
        drop(handle);

        if !script_path.is_file() {
            return Err(MigrateError::Engine(format!(
                "Recovery of {} did not write {}",
                database_file.display(),
                script_path.display()
            ))
            .in_stage(Stage::Export, &record.version_string(), &database_file));
        }

        info!("Recovered {} into {}", database_file.display(), script_path.display());
        Ok(MigrationResult {
            source: database_file,
            script_path,
            database_path: None,
            from_version: Some(record.version_string()),
            to_version: None,
            commands: Vec::new(),
            stage: Stage::Done,
            recommendations: Vec::new(),
            finished_at: Utc::now(),
        })
    }

    /// Checks a database for column definitions that won't survive the
    /// migration. Opens the database read-only and never changes it.
    pub fn verify_source(
        &self,
        record: &VersionRecord,
        source: &Path,
        credentials: &Credentials,
    ) -> Result<Vec<Recommendation>, MigrateError> {
        let (base, storage) = match SourceKind::classify(source)? {
            SourceKind::Native { base, storage } => (base, storage),
            SourceKind::Script { .. } => return Err(MigrateError::UnsupportedSource(source.to_path_buf())),
        };

        let version = record.version_string();
        let in_export = |e: MigrateError| e.in_stage(Stage::Export, &version, source);

        let mut handle = self.loader.load(record).map_err(in_export)?;
        let locator = DatabaseLocator::source(&base, storage, AccessMode::ReadOnly, "");
        let mut conn = handle.connect(&locator, credentials).map_err(in_export)?;
        verify::verify(conn.as_mut(), self.decimal_threshold).map_err(in_export)
    }

    fn enter(&self, stage: Stage, path: &Path) -> Result<(), MigrateError> {
        self.check_interrupted()?;
        debug!("{}: {}", stage, path.display());
        Ok(())
    }

    fn resolve_to(&self, request: &MigrationRequest) -> Result<&VersionRecord, MigrateError> {
        match request.to.as_deref() {
            Some(spec) => self.registry.resolve(spec),
            None => self
                .registry
                .newest()
                .ok_or_else(|| MigrateError::Resolution("No H2 drivers are registered".into())),
        }
    }

    /// Dumps a native database to a script with `from`, running its EXPORT and
    /// IMPORT hooks first. The reader is released before returning.
    fn export(
        &self,
        from: &VersionRecord,
        base: &Path,
        storage: StorageKind,
        request: &MigrationRequest,
    ) -> Result<Exported, MigrateError> {
        self.enter(Stage::Export, &request.source)?;
        let _tmr = timer!(Level::Info; "Migrator.export", "{} with {}", request.source.display(), from);

        let in_stage = |e: MigrateError| e.in_stage(Stage::Export, &from.version_string(), &request.source);

        let hooks = HookSet::load(&from.version_string(), self.hooks_dir.as_deref()).map_err(in_stage)?;
        // EXPORT hooks clean up the source, everything else only reads it
        let access = if hooks.has_stage(HookStage::Export) {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        };

        let script = script_path_for(base, request.script.as_deref(), request.compression);
        let mut handle = self.loader.load(from).map_err(in_stage)?;
        let locator = DatabaseLocator::source(base, storage, access, &request.connection_params);
        let mut conn = handle.connect(&locator, &request.credentials).map_err(in_stage)?;

        hooks.run(conn.as_mut(), HookStage::Export);
        let commands = hooks.run(conn.as_mut(), HookStage::Import);

        let mut recommendations = Vec::new();
        if request.verify {
            recommendations = verify::verify(conn.as_mut(), self.decimal_threshold).map_err(in_stage)?;
            if !recommendations.is_empty() {
                if !request.force {
                    return Err(MigrateError::Verification(recommendations));
                }
                warn!(
                    "Continuing despite {} verification findings in {}",
                    recommendations.len(),
                    request.source.display()
                );
            }
        }

        let options = script_options(request.compression, "");
        if from.has_script_tool() {
            conn.dump_script(&script, &options).map_err(in_stage)?;
        } else {
            let statement = [
                format!("SCRIPT TO {}", sql_literal(&script.to_string_lossy())),
                options,
            ]
            .join(" ");
            conn.execute(statement.trim()).map_err(in_stage)?;
        }

        drop(conn);
        drop(handle);

        info!("Exported {} to {}", request.source.display(), script.display());
        Ok(Exported {
            script,
            commands,
            recommendations,
        })
    }

    /// Rebuilds the database under `to` from the exported script, replays
    /// the buffered commands, and assembles the result.
    fn import_and_finalize(
        &self,
        request: &MigrationRequest,
        source: &SourceKind,
        from: Option<&VersionRecord>,
        to: &VersionRecord,
        exported: Exported,
    ) -> Result<MigrationResult, MigrateError> {
        let compression = match source {
            SourceKind::Script { compression, .. } => *compression,
            SourceKind::Native { .. } => request.compression,
        };

        let target = target_base(source.base(), to);
        let storage = to.storage_kind();
        let target_file = storage.storage_file(&target);

        self.enter(Stage::Import, &target_file)?;
        let in_stage = |e: MigrateError| e.in_stage(Stage::Import, &to.version_string(), &target_file);

        let commands = {
            let _tmr = timer!(Level::Info; "Migrator.import", "{} with {}", target_file.display(), to);

            prepare_target(&target_file, request.overwrite).map_err(in_stage)?;
            let hooks = HookSet::load(&to.version_string(), self.hooks_dir.as_deref()).map_err(in_stage)?;

            let mut handle = self.loader.load(to).map_err(in_stage)?;
            let locator = DatabaseLocator::target(&target, storage, &request.connection_params);
            let mut conn = handle.connect(&locator, &request.credentials).map_err(in_stage)?;

            conn.run_script(
                &exported.script,
                &script_options(compression, &request.upgrade_options),
            )
            .map_err(in_stage)?;

            let mut commands = exported.commands;
            for command in &commands {
                conn.execute(command).map_err(in_stage)?;
            }

            let init = hooks.run(conn.as_mut(), HookStage::Init);
            for command in &init {
                conn.execute(command).map_err(in_stage)?;
            }
            commands.extend(init);

            conn.analyze().map_err(in_stage)?;
            conn.compact().map_err(in_stage)?;
            commands
        };

        self.enter(Stage::Finalize, &target_file)?;
        info!(
            "Migrated {} to {} with {}",
            request.source.display(),
            target_file.display(),
            to
        );

        Ok(MigrationResult {
            source: request.source.clone(),
            script_path: exported.script,
            database_path: Some(target_file),
            from_version: from.map(VersionRecord::version_string),
            to_version: Some(to.version_string()),
            commands,
            stage: Stage::Done,
            recommendations: exported.recommendations,
            finished_at: Utc::now(),
        })
    }
}

/// Makes room for the rebuilt database. An existing regular, writable file
/// is deleted only when overwriting was requested.
fn prepare_target(target_file: &Path, overwrite: bool) -> Result<(), MigrateError> {
    let metadata = match fs::symlink_metadata(target_file) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_file() {
        return Err(MigrateError::IrregularTarget(target_file.to_path_buf()));
    }
    if !overwrite || metadata.permissions().readonly() {
        return Err(MigrateError::Conflict(target_file.to_path_buf()));
    }

    warn!("Overwriting {}", target_file.display());
    fs::remove_file(target_file)?;
    Ok(())
}

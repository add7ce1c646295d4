use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn, Level};
use logging_timer::timer;
use phf::Map;
use phf_macros::phf_map;

use crate::engine::{Connection, Credentials, DatabaseLocator, Engine, EngineLauncher};
use crate::error::MigrateError;
use crate::scratch::ScratchDir;
use crate::version::{Locator, VersionRecord};

/// Internal classes some releases must resolve right after loading, to avoid
/// a lazy initialization defect in those releases.
static BUILTIN_QUIRKS: Map<&'static str, &'static [&'static str]> = phf_map! {
    "2" => &[
        "org.h2.table.InformationSchemaTable",
        "org.h2.mvstore.MVMap$2",
        "org.h2.mvstore.MVMap$2$1",
        "org.h2.index.MetaIndex",
        "org.h2.api.ErrorCode",
    ],
};

/// Version → symbols to pre-touch after loading. Keys are a full version
/// (`2.0.201`), a `major.minor` prefix (`2.0`) or a major version (`2`);
/// the most specific match wins.
#[derive(Debug, Clone)]
pub struct QuirkTable {
    entries: HashMap<String, Vec<String>>,
}

impl Default for QuirkTable {
    fn default() -> Self {
        let entries = BUILTIN_QUIRKS
            .entries()
            .map(|(version, symbols)| {
                (
                    version.to_string(),
                    symbols.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        QuirkTable { entries }
    }
}

impl QuirkTable {
    pub fn empty() -> Self {
        QuirkTable {
            entries: HashMap::new(),
        }
    }

    /// The built in table plus configured entries, which replace built in
    /// entries for the same key
    pub fn with_overrides(overrides: &HashMap<String, Vec<String>>) -> Self {
        let mut table = Self::default();
        for (version, symbols) in overrides {
            table
                .entries
                .insert(version.trim().to_ascii_lowercase(), symbols.clone());
        }
        table
    }

    pub fn symbols_for(&self, record: &VersionRecord) -> &[String] {
        let full = record.version_string().to_ascii_lowercase();
        let partial = format!("{}.{}", record.major(), record.minor());
        let major = record.major().to_string();

        self.entries
            .get(&full)
            .or_else(|| self.entries.get(&partial))
            .or_else(|| self.entries.get(&major))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// The live capability of one loaded driver version.
///
/// Owned by whoever loaded it. Dropping the handle tears its isolation
/// boundary down, so connections borrow from the handle and can't outlive it.
pub struct CapabilityHandle {
    engine: Box<dyn Engine>,
    record: VersionRecord,
    reported_version: String,
}

impl CapabilityHandle {
    pub fn record(&self) -> &VersionRecord {
        &self.record
    }

    /// The version string the driver reported when it was probed
    pub fn reported_version(&self) -> &str {
        &self.reported_version
    }

    pub fn connect(
        &mut self,
        locator: &DatabaseLocator,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection + '_>, MigrateError> {
        self.engine.connect(locator, credentials)
    }

    pub fn recover(&mut self, folder: &Path, database_name: &str) -> Result<(), MigrateError> {
        self.engine.recover(folder, database_name)
    }
}

impl Drop for CapabilityHandle {
    fn drop(&mut self) {
        self.engine.shutdown();
        debug!("Released {}", self.record);
    }
}

/// Loads driver versions, each into its own isolation boundary
pub struct IsolationLoader {
    launcher: Arc<dyn EngineLauncher>,
    scratch: Arc<ScratchDir>,
    quirks: QuirkTable,
}

impl IsolationLoader {
    pub fn new(launcher: Arc<dyn EngineLauncher>, scratch: Arc<ScratchDir>, quirks: QuirkTable) -> Self {
        IsolationLoader {
            launcher,
            scratch,
            quirks,
        }
    }

    /// Loads `record`'s artifact, probes it with an in-memory connection and
    /// applies the release's quirks. A missing artifact or failed probe fails
    /// the load; a failed quirk fix-up only warns.
    pub fn load(&self, record: &VersionRecord) -> Result<CapabilityHandle, MigrateError> {
        let _tmr = timer!(Level::Debug; "IsolationLoader.load", "{}", record);

        let load_error = |reason: String| MigrateError::Load {
            version: record.version_string(),
            reason,
        };

        let artifact = self.artifact_path(record).map_err(|e| load_error(e.to_string()))?;
        let engine = self
            .launcher
            .launch(record, &artifact)
            .map_err(|e| match e {
                MigrateError::Load { .. } => e,
                other => load_error(other.to_string()),
            })?;

        let mut handle = CapabilityHandle {
            engine,
            record: record.clone(),
            reported_version: String::new(),
        };

        // On failure the handle is dropped here, which tears the boundary down
        handle.reported_version = handle
            .engine
            .reported_version()
            .map_err(|e| load_error(format!("probe connection failed: {e}")))?;

        let symbols = self.quirks.symbols_for(record);
        if !symbols.is_empty() {
            match handle.engine.force_resolve(symbols) {
                Ok(()) => debug!("Pre-resolved {} classes for {}", symbols.len(), record),
                Err(e) => warn!("Quirk fix-up for {} failed, continuing: {}", record, e),
            }
        }

        info!("Loaded {} from {}", record, artifact.display());
        Ok(handle)
    }

    fn artifact_path(&self, record: &VersionRecord) -> Result<PathBuf, MigrateError> {
        match record.locator() {
            Locator::File(path) if path.is_file() => Ok(path.clone()),
            Locator::File(path) => Err(MigrateError::Error(format!(
                "driver artifact {} not found",
                path.display()
            ))),
            Locator::Bundled(name) => self.scratch.extract_driver(name),
        }
    }
}

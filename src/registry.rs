use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn, Level};
use logging_timer::timer;

use crate::error::MigrateError;
use crate::loader::IsolationLoader;
use crate::scratch::bundled_driver_names;
use crate::version::{artifact_version_token, BuildTags, Locator, VersionRecord, VersionSpec};

/// Every driver version that could be loaded, in version order.
///
/// Populated once by [`Registry::discover`] and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: BTreeSet<VersionRecord>,
}

impl Registry {
    pub fn from_records(records: impl IntoIterator<Item = VersionRecord>) -> Self {
        Registry {
            records: records.into_iter().collect(),
        }
    }

    /// Finds driver artifacts in the bundled resources and under `locations`
    /// (directories are walked recursively, files are taken as they are).
    ///
    /// Each candidate is loaded just long enough to probe its reported
    /// version. Candidates that fail to parse or load are skipped with a
    /// warning, as are duplicates of a version found earlier.
    pub fn discover(
        locations: &[PathBuf],
        loader: &IsolationLoader,
        tags: &BuildTags,
    ) -> Result<Self, MigrateError> {
        let _tmr = timer!(Level::Info; "Registry.discover");

        let mut candidates: Vec<(String, Locator)> = bundled_driver_names()
            .into_iter()
            .map(|name| (name.clone(), Locator::Bundled(name)))
            .collect();

        for location in locations {
            if location.is_dir() {
                collect_artifacts(location, &mut candidates)?;
            } else if location.is_file() {
                match location.file_name().and_then(|n| n.to_str()) {
                    Some(name) if artifact_version_token(name).is_some() => {
                        candidates.push((name.to_owned(), Locator::File(location.clone())));
                    }
                    _ => warn!(
                        "{} is not an H2 driver artifact, ignoring it",
                        location.display()
                    ),
                }
            } else {
                warn!("Driver location {} does not exist", location.display());
            }
        }

        let mut registry = Registry::default();
        for (name, locator) in candidates {
            let record = match VersionRecord::from_artifact_name(&name, locator, tags) {
                Ok(record) => record,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };

            if let Some(existing) = registry.records.get(&record) {
                warn!(
                    "Skipping {} from {}: already registered from {}",
                    record,
                    record.locator(),
                    existing.locator()
                );
                continue;
            }

            let reported = match loader.load(&record) {
                Ok(handle) => handle.reported_version().to_owned(),
                Err(e) => {
                    warn!("Skipping {} from {}: {}", record, record.locator(), e);
                    continue;
                }
            };
            if !record.matches_reported(&reported) {
                warn!(
                    "{} from {} reports itself as version {}",
                    record,
                    record.locator(),
                    reported
                );
            }

            registry.records.insert(record);
        }

        info!("Registered {} H2 driver versions", registry.records.len());
        Ok(registry)
    }

    /// Resolves a `major.minor.patch[-build]` spec to the exact record, or a
    /// `major.minor` spec to the newest record of that release line.
    pub fn resolve(&self, spec: &str) -> Result<&VersionRecord, MigrateError> {
        let parsed = VersionSpec::parse(spec)?;

        let found = match parsed {
            VersionSpec::Full { .. } => self.records.iter().find(|r| r.matches(&parsed)),
            VersionSpec::Partial { .. } => self.records.iter().rev().find(|r| r.matches(&parsed)),
        };

        found.ok_or_else(|| {
            MigrateError::Resolution(format!("No H2 driver registered for version {parsed}"))
        })
    }

    pub fn newest(&self) -> Option<&VersionRecord> {
        self.records.last()
    }

    /// Newest first
    pub fn descending(&self) -> impl Iterator<Item = &VersionRecord> {
        self.records.iter().rev()
    }

    pub fn records(&self) -> impl Iterator<Item = &VersionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Walks `dir` in path order, following symbolic links. Only a failure to
/// read `dir` itself is an error; anything unreadable below it is skipped
/// with a warning.
fn collect_artifacts(dir: &Path, candidates: &mut Vec<(String, Locator)>) -> Result<(), MigrateError> {
    let mut visited = HashSet::new();
    let entries = fs::read_dir(dir)?;
    visited.insert(dunce::canonicalize(dir)?);
    walk_entries(dir, entries, candidates, &mut visited);
    Ok(())
}

fn walk_entries(
    dir: &Path,
    entries: fs::ReadDir,
    candidates: &mut Vec<(String, Locator)>,
    visited: &mut HashSet<PathBuf>,
) {
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) => warn!("Skipping an entry of {}: {}", dir.display(), e),
        }
    }
    paths.sort();

    for path in paths {
        // fs::metadata follows links, so linked jars and directories count
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        if metadata.is_dir() {
            let canonical = match dunce::canonicalize(&path) {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if !visited.insert(canonical) {
                debug!("Already walked {}, not following it again", path.display());
                continue;
            }
            match fs::read_dir(&path) {
                Ok(sub_entries) => walk_entries(&path, sub_entries, candidates, visited),
                Err(e) => warn!("Skipping driver directory {}: {}", path.display(), e),
            }
        } else if metadata.is_file() {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if artifact_version_token(&name).is_some() {
                candidates.push((name, Locator::File(path)));
            }
        }
    }
}

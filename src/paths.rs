use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::MigrateError;
use crate::version::VersionRecord;

pub const SCRIPT_SUFFIX: &str = ".sql";

/// The two on-disk storage formats of H2 and their file suffixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StorageKind {
    /// `*.mv.db`, written by 1.4 and later
    MvStore,
    /// `*.h2.db`, written by 1.3 and earlier
    PageStore,
}

impl StorageKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            StorageKind::MvStore => ".mv.db",
            StorageKind::PageStore => ".h2.db",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        [StorageKind::MvStore, StorageKind::PageStore]
            .into_iter()
            .find(|kind| lower.ends_with(kind.suffix()) && lower.len() > kind.suffix().len())
    }

    /// The storage file for a database base name (the path without suffix).
    pub fn storage_file(&self, base: &Path) -> PathBuf {
        append_to_file_name(base, self.suffix())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Compression {
    #[default]
    #[strum(serialize = "NONE")]
    #[serde(rename = "NONE")]
    None,
    #[strum(serialize = "GZIP")]
    #[serde(rename = "GZIP")]
    Gzip,
    #[strum(serialize = "ZIP")]
    #[serde(rename = "ZIP")]
    Zip,
}

impl Compression {
    /// Suffix appended after `.sql`
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zip => ".zip",
        }
    }

    /// The option understood by `SCRIPT` and `RUNSCRIPT`
    pub fn option(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => "COMPRESSION GZIP",
            Compression::Zip => "COMPRESSION ZIP",
        }
    }

    /// Infers the compression of a script from its file name
    pub fn from_script_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        [Compression::Gzip, Compression::Zip, Compression::None]
            .into_iter()
            .find(|c| {
                let suffix = format!("{}{}", SCRIPT_SUFFIX, c.suffix());
                lower.ends_with(&suffix) && lower.len() > suffix.len()
            })
    }
}

/// What the migration starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// A native database file; `base` is its path without the storage suffix
    Native { base: PathBuf, storage: StorageKind },
    /// A previously exported script; `base` is its path without script suffixes
    Script {
        path: PathBuf,
        base: PathBuf,
        compression: Compression,
    },
}

impl SourceKind {
    pub fn classify(path: &Path) -> Result<Self, MigrateError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrateError::UnsupportedSource(path.to_path_buf()))?;

        if let Some(storage) = StorageKind::from_file_name(name) {
            let base = strip_file_name_suffix(path, storage.suffix().len());
            return Ok(SourceKind::Native { base, storage });
        }

        if let Some(compression) = Compression::from_script_name(name) {
            let suffix_len = SCRIPT_SUFFIX.len() + compression.suffix().len();
            let base = strip_file_name_suffix(path, suffix_len);
            return Ok(SourceKind::Script {
                path: path.to_path_buf(),
                base,
                compression,
            });
        }

        Err(MigrateError::UnsupportedSource(path.to_path_buf()))
    }

    pub fn base(&self) -> &Path {
        match self {
            SourceKind::Native { base, .. } => base,
            SourceKind::Script { base, .. } => base,
        }
    }

    /// The logical database name, i.e. the base's file name
    pub fn database_name(&self) -> String {
        self.base()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Chooses the script file written by an export. A requested name gets the
/// compression suffix appended when it doesn't carry it yet; otherwise the
/// script sits next to the database as `<base>.sql[.gz|.zip]`.
pub fn script_path_for(base: &Path, requested: Option<&Path>, compression: Compression) -> PathBuf {
    match requested {
        Some(requested) => {
            let name = requested
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if name.ends_with(compression.suffix()) {
                requested.to_path_buf()
            } else {
                append_to_file_name(requested, compression.suffix())
            }
        }
        None => append_to_file_name(base, &format!("{}{}", SCRIPT_SUFFIX, compression.suffix())),
    }
}

/// The base name of a rebuilt database: `<base>.<patch>[-<build>]`
pub fn target_base(base: &Path, to: &VersionRecord) -> PathBuf {
    append_to_file_name(base, &format!(".{}", to.target_suffix()))
}

/// Joins the compression option and the user's upgrade options
pub fn script_options(compression: Compression, upgrade_options: &str) -> String {
    [compression.option(), upgrade_options.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lists the native database files directly inside `dir`, sorted by name.
pub fn native_files_in(dir: &Path) -> Result<Vec<PathBuf>, MigrateError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let is_native = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(StorageKind::from_file_name)
            .is_some();
        if is_native {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Resolves a user supplied path: expands a leading `~` or `${user.home}` and
/// makes relative paths absolute against the working directory.
pub fn absolute_path(raw: &str) -> Result<PathBuf, MigrateError> {
    let raw = raw.trim();
    let expanded = if let Some(rest) = raw.strip_prefix("${user.home}") {
        home_dir()?.join(rest.trim_start_matches(['/', '\\']))
    } else if raw == "~" {
        home_dir()?
    } else if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        home_dir()?.join(rest)
    } else {
        PathBuf::from(raw)
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir()?.join(expanded)
    };

    Ok(dunce::simplified(&absolute).to_path_buf())
}

fn home_dir() -> Result<PathBuf, MigrateError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| MigrateError::Error("Could not determine the home directory".into()))
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn strip_file_name_suffix(path: &Path, suffix_len: usize) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = &name[..name.len().saturating_sub(suffix_len)];
    path.with_file_name(stem)
}

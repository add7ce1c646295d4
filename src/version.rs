use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::Serialize;

use crate::error::MigrateError;
use crate::paths::StorageKind;

#[derive(Parser)]
#[grammar = "version.pest"]
pub struct VersionParser;

/// Driver artifacts are recognized by this file name prefix (case-insensitive)
pub const ARTIFACT_PREFIX: &str = "h2";
/// ... and this suffix
pub const ARTIFACT_SUFFIX: &str = ".jar";

/// The curated, chronological list of known build identifiers. A build tag's
/// position in this list defines its order among records sharing the same
/// major.minor.patch.
#[derive(Debug, Clone, Default)]
pub struct BuildTags {
    ids: Vec<String>,
}

impl BuildTags {
    /// Reads one build id per line: the first whitespace separated token,
    /// ignoring blank lines and `#` comments. Oldest first, matching the
    /// output of `git log --reverse --format="%h %s"`.
    pub fn from_lines(text: &str) -> Self {
        let ids = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_whitespace().next())
            .map(|id| id.to_ascii_lowercase())
            .collect();

        BuildTags { ids }
    }

    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let text = fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!(
                "Failed to read build tags file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_lines(&text))
    }

    pub fn rank(&self, tag: &str) -> Option<usize> {
        let tag = tag.to_ascii_lowercase();
        self.ids.iter().position(|id| *id == tag)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Where a driver artifact can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Locator {
    /// A driver jar on the file system
    File(PathBuf),
    /// A driver jar embedded in this binary, by file name
    Bundled(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Bundled(name) => write!(f, "bundled:{name}"),
        }
    }
}

/// A parsed version request: either a complete `major.minor.patch[-build]`
/// or just `major.minor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Full {
        major: u32,
        minor: u32,
        patch: u32,
        build_tag: String,
    },
    Partial {
        major: u32,
        minor: u32,
    },
}

impl VersionSpec {
    pub fn parse(spec: &str) -> Result<Self, MigrateError> {
        let spec = spec.trim();
        let mut parsed = VersionParser::parse(Rule::version_spec, spec).map_err(|e| {
            MigrateError::Resolution(format!(
                "'{}' is not a valid version, expected major.minor.patch[-build] or major.minor:\n{}",
                spec, e
            ))
        })?;

        // version_spec -> full_version | partial_version
        let version_pair = parsed
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| MigrateError::Resolution(format!("'{spec}' is not a valid version")))?;

        match version_pair.as_rule() {
            Rule::full_version => {
                let (major, minor, patch, build_tag) = parse_full(version_pair)?;
                Ok(VersionSpec::Full {
                    major,
                    minor,
                    patch,
                    build_tag,
                })
            }
            Rule::partial_version => {
                let mut numbers = version_pair.into_inner();
                let major = parse_number(numbers.next())?;
                let minor = parse_number(numbers.next())?;
                Ok(VersionSpec::Partial { major, minor })
            }
            _ => Err(MigrateError::Resolution(format!(
                "'{spec}' is not a valid version"
            ))),
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Full {
                major,
                minor,
                patch,
                build_tag,
            } if build_tag.is_empty() => write!(f, "{major}.{minor}.{patch}"),
            VersionSpec::Full {
                major,
                minor,
                patch,
                build_tag,
            } => write!(f, "{major}.{minor}.{patch}-{build_tag}"),
            VersionSpec::Partial { major, minor } => write!(f, "{major}.{minor}"),
        }
    }
}

fn parse_number(pair: Option<Pair<Rule>>) -> Result<u32, MigrateError> {
    let pair = pair.ok_or_else(|| MigrateError::Resolution("Missing version number".into()))?;
    pair.as_str().parse::<u32>().map_err(|e| {
        MigrateError::Resolution(format!("Invalid version number '{}': {}", pair.as_str(), e))
    })
}

fn parse_full(pair: Pair<Rule>) -> Result<(u32, u32, u32, String), MigrateError> {
    let mut inner = pair.into_inner();
    let major = parse_number(inner.next())?;
    let minor = parse_number(inner.next())?;
    let patch = parse_number(inner.next())?;
    let build_tag = inner
        .next()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_default();

    Ok((major, minor, patch, build_tag))
}

/// One installed copy of the H2 driver.
///
/// Records are totally ordered by major, minor and patch. A record without a
/// build tag sorts before tagged records of the same release, and tagged
/// records are ordered by the tag's position in [`BuildTags`]. A tag unknown to
/// that list can't be ordered, so such records are rejected at creation.
#[derive(Debug, Clone, Serialize)]
pub struct VersionRecord {
    major: u32,
    minor: u32,
    patch: u32,
    build_tag: String,
    #[serde(skip)]
    build_rank: Option<usize>,
    locator: Locator,
}

impl VersionRecord {
    pub fn new(
        major: u32,
        minor: u32,
        patch: u32,
        build_tag: &str,
        locator: Locator,
        tags: &BuildTags,
    ) -> Result<Self, MigrateError> {
        let build_rank = if build_tag.is_empty() {
            None
        } else {
            Some(tags.rank(build_tag).ok_or_else(|| {
                MigrateError::Resolution(format!(
                    "Build '{}' of {}.{}.{} is not in the list of known builds and can't be ordered",
                    build_tag, major, minor, patch
                ))
            })?)
        };

        Ok(VersionRecord {
            major,
            minor,
            patch,
            build_tag: build_tag.to_owned(),
            build_rank,
            locator,
        })
    }

    /// Parses the version from a driver file name such as `h2-1.4.200.jar`.
    /// The version is never taken from metadata inside the artifact.
    pub fn from_artifact_name(
        file_name: &str,
        locator: Locator,
        tags: &BuildTags,
    ) -> Result<Self, MigrateError> {
        let version = artifact_version_token(file_name).ok_or_else(|| {
            MigrateError::Resolution(format!(
                "'{}' does not follow the {}-<version>{} naming convention",
                file_name, ARTIFACT_PREFIX, ARTIFACT_SUFFIX
            ))
        })?;

        let mut parsed = VersionParser::parse(Rule::full_version_EOI, version).map_err(|e| {
            MigrateError::Resolution(format!(
                "'{}' does not carry a valid version: {}",
                file_name, e
            ))
        })?;

        let full = parsed
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| MigrateError::Resolution(format!("'{file_name}' has no version")))?;
        let (major, minor, patch, build_tag) = parse_full(full)?;

        Self::new(major, minor, patch, &build_tag, locator, tags)
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn patch(&self) -> u32 {
        self.patch
    }

    pub fn build_tag(&self) -> &str {
        &self.build_tag
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// `major.minor.patch[-build]`
    pub fn version_string(&self) -> String {
        if self.build_tag.is_empty() {
            format!("{}.{}.{}", self.major, self.minor, self.patch)
        } else {
            format!(
                "{}.{}.{}-{}",
                self.major, self.minor, self.patch, self.build_tag
            )
        }
    }

    /// The `patch[-build]` part appended to rebuilt database names, so that
    /// migrations to different target versions never collide.
    pub fn target_suffix(&self) -> String {
        if self.build_tag.is_empty() {
            self.patch.to_string()
        } else {
            format!("{}-{}", self.patch, self.build_tag)
        }
    }

    /// Releases up to 1.3 have no script tool and are dumped with a plain
    /// `SCRIPT TO` statement instead.
    pub fn has_script_tool(&self) -> bool {
        (self.major, self.minor) > (1, 3)
    }

    /// The storage format this release writes by default.
    pub fn storage_kind(&self) -> StorageKind {
        if (self.major, self.minor) >= (1, 4) {
            StorageKind::MvStore
        } else {
            StorageKind::PageStore
        }
    }

    pub fn matches(&self, spec: &VersionSpec) -> bool {
        match spec {
            VersionSpec::Full {
                major,
                minor,
                patch,
                build_tag,
            } => {
                self.major == *major
                    && self.minor == *minor
                    && self.patch == *patch
                    && self.build_tag.eq_ignore_ascii_case(build_tag)
            }
            VersionSpec::Partial { major, minor } => {
                self.major == *major && self.minor == *minor
            }
        }
    }

    /// Checks a runtime reported version (e.g. `1.4.200 (2019-10-14)`) against
    /// this record's numeric version.
    pub fn matches_reported(&self, reported: &str) -> bool {
        let numeric = format!("{}.{}.{}", self.major, self.minor, self.patch);
        reported
            .trim()
            .split(|c: char| c.is_whitespace() || c == '-')
            .next()
            .is_some_and(|token| token == numeric)
    }

    fn sort_key(&self) -> (u32, u32, u32, Option<usize>) {
        (self.major, self.minor, self.patch, self.build_rank)
    }
}

/// Returns the version part of a driver file name, or None when the name does
/// not follow the artifact naming convention.
pub fn artifact_version_token(file_name: &str) -> Option<&str> {
    let lower = file_name.to_ascii_lowercase();
    if !lower.starts_with(ARTIFACT_PREFIX) || !lower.ends_with(ARTIFACT_SUFFIX) {
        return None;
    }
    if lower.len() <= ARTIFACT_PREFIX.len() + ARTIFACT_SUFFIX.len() {
        return None;
    }

    // to_ascii_lowercase preserves byte offsets, so the original can be sliced
    let middle = &file_name[ARTIFACT_PREFIX.len()..file_name.len() - ARTIFACT_SUFFIX.len()];
    let token = middle.trim_start_matches(['-', '_']);
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

impl fmt::Display for VersionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H2-{}", self.version_string())
    }
}

impl PartialEq for VersionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for VersionRecord {}

impl PartialOrd for VersionRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

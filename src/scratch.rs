use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use rust_embed::RustEmbed;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::error::MigrateError;
use crate::version::artifact_version_token;

/// Driver jars shipped inside the binary
#[derive(RustEmbed)]
#[folder = "drivers/"]
struct BundledDrivers;

/// Names of the bundled driver artifacts
pub fn bundled_driver_names() -> Vec<String> {
    let mut names: Vec<String> = BundledDrivers::iter()
        .map(|name| name.into_owned())
        .filter(|name| !name.contains('/') && artifact_version_token(name).is_some())
        .collect();
    names.sort();
    names
}

/// Directory that bundled drivers are extracted to before loading.
///
/// The root is shared by every h2migrate process of a user. Extraction is
/// idempotent: an existing copy whose SHA-256 matches the embedded artifact
/// is reused, anything else is replaced by writing a temp file and renaming
/// it into place. Extracted drivers stay for the next run. Each `ScratchDir`
/// gets its own work directory under the root, removed when it is dropped.
pub struct ScratchDir {
    root: PathBuf,
    work: Option<TempDir>,
    extract_lock: Mutex<()>,
}

impl ScratchDir {
    pub fn new(root: PathBuf) -> Result<Self, MigrateError> {
        fs::create_dir_all(&root)?;
        let work = tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(&root)?;
        debug!("Scratch work directory is {}", work.path().display());

        Ok(ScratchDir {
            root,
            work: Some(work),
            extract_lock: Mutex::new(()),
        })
    }

    /// Where result files of engine calls go; private to this process
    pub fn work_dir(&self) -> PathBuf {
        match &self.work {
            Some(work) => work.path().to_path_buf(),
            None => self.root.join("work"),
        }
    }

    /// Extracts a bundled driver and returns the path to load it from
    pub fn extract_driver(&self, name: &str) -> Result<PathBuf, MigrateError> {
        let file = BundledDrivers::get(name)
            .ok_or_else(|| MigrateError::Error(format!("No bundled driver named {name}")))?;
        self.extract(name, &file.data, &file.metadata.sha256_hash())
    }

    fn extract(&self, name: &str, data: &[u8], digest: &[u8]) -> Result<PathBuf, MigrateError> {
        // Two migrations in this process must not race to write the same artifact
        let _guard = self.extract_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.root.join("drivers");
        let dest = dir.join(name);

        if dest.is_file() && Self::file_digest(&dest)? == digest {
            debug!("Reusing extracted driver {}", dest.display());
            return Ok(dest);
        }

        // The temp name is unique per process; the rename is atomic, so another
        // process never sees a partial jar
        fs::create_dir_all(&dir)?;
        let temp = dir.join(format!(".{}.{}.tmp", name, std::process::id()));
        fs::write(&temp, data)?;
        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        debug!(
            "Extracted driver {} (sha256 {})",
            dest.display(),
            hex::encode(digest)
        );
        Ok(dest)
    }

    fn file_digest(path: &Path) -> Result<Vec<u8>, MigrateError> {
        let bytes = fs::read(path)?;
        Ok(Sha256::digest(&bytes).to_vec())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            let path = work.path().to_path_buf();
            if let Err(e) = work.close() {
                warn!("Could not remove scratch work directory {}: {}", path.display(), e);
            }
        }
    }
}

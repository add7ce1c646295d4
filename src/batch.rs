use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::bounded;
use log::{error, info};
use threadpool::ThreadPool;

use crate::error::MigrateError;
use crate::migrator::{MigrationRequest, MigrationResult, Migrator};

/// Outcome of migrating every database in a directory. Files are listed in
/// path order within each half.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(PathBuf, MigrationResult)>,
    pub failed: Vec<(PathBuf, MigrateError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Migrated {} of {} databases",
            self.succeeded.len(),
            self.total()
        )?;
        for (path, result) in &self.succeeded {
            let target = result
                .database_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            write!(f, "\n  ok      {} -> {}", path.display(), target)?;
        }
        for (path, err) in &self.failed {
            write!(f, "\n  FAILED  {}: {}", path.display(), err)?;
        }
        Ok(())
    }
}

/// Runs an auto migration for each file on a pool of `threads` workers.
///
/// Each file's own pipeline stays sequential; a failing file never stops the
/// others. An interruption observed by any worker fails the whole batch.
pub fn run(
    migrator: &Migrator,
    files: Vec<PathBuf>,
    request: &MigrationRequest,
    threads: usize,
) -> Result<BatchReport, MigrateError> {
    let num_threads = threads.min(files.len()).max(1);
    let (sender, receiver) = bounded::<PathBuf>(num_threads);
    let outcomes = Arc::new(Mutex::new(Vec::with_capacity(files.len())));
    let pool = ThreadPool::new(num_threads);

    for _ in 0..num_threads {
        let receiver = receiver.clone();
        let migrator = migrator.clone();
        let request = request.clone();
        let outcomes = Arc::clone(&outcomes);

        pool.execute(move || {
            while let Ok(path) = receiver.recv() {
                // Every file gets its own default script next to it
                let file_request = MigrationRequest {
                    source: path.clone(),
                    script: None,
                    ..request.clone()
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| migrator.migrate_file_auto(&file_request)))
                    .unwrap_or_else(|payload| Err(MigrateError::Error(panic_message(payload.as_ref()))));
                if let Err(e) = &outcome {
                    error!("Migrating {} failed: {}", path.display(), e);
                }
                outcomes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((path, outcome));
            }
        });
    }
    drop(receiver);

    let expected = files.clone();
    for file in files {
        // Blocks while every worker is busy
        if sender.send(file).is_err() {
            break;
        }
    }
    drop(sender);
    pool.join();

    let mut outcomes = std::mem::take(&mut *outcomes.lock().unwrap_or_else(|e| e.into_inner()));
    // A worker that died anyway leaves files without an outcome
    for path in expected {
        if !outcomes.iter().any(|(p, _)| p == &path) {
            error!("No outcome recorded for {}", path.display());
            outcomes.push((
                path,
                Err(MigrateError::Error("The migration worker stopped unexpectedly".into())),
            ));
        }
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut report = BatchReport::default();
    for (path, outcome) in outcomes {
        match outcome {
            Ok(result) => report.succeeded.push((path, result)),
            Err(MigrateError::Interrupted) => return Err(MigrateError::Interrupted),
            Err(e) => report.failed.push((path, e)),
        }
    }

    info!(
        "Batch finished: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    Ok(report)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_owned());
    format!("The migration panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{IsolationLoader, QuirkTable};
    use crate::migrator::AutoOutcome;
    use crate::registry::Registry;
    use crate::scratch::ScratchDir;
    use crate::testing::{create_database, driver, written_by, FakeBehavior, FakeLauncher};
    use std::fs;
    use std::path::Path;

    fn migrator(dir: &Path, scratch: &Path, threads: usize) -> Migrator {
        let drivers = dir.join("drivers");
        fs::create_dir_all(&drivers).unwrap();
        let registry = Registry::from_records(["1.4.200", "2.0.201"].iter().map(|v| driver(&drivers, v)));
        let loader = IsolationLoader::new(
            Arc::new(FakeLauncher::new()),
            Arc::new(ScratchDir::new(scratch.to_path_buf()).unwrap()),
            QuirkTable::empty(),
        );
        Migrator::new(Arc::new(registry), Arc::new(loader)).with_batch_threads(threads)
    }

    fn data_dir(dir: &Path) -> PathBuf {
        let data = dir.join("data");
        fs::create_dir_all(&data).unwrap();
        let writer = driver(dir, "1.4.200");
        create_database(&data.join("alpha"), &writer);
        create_database(&data.join("gamma"), &writer);
        // Larger than a page, so it can't pass for an empty database
        fs::write(data.join("beta.mv.db"), vec![0xAB_u8; 16 * 1024]).unwrap();
        fs::write(data.join("notes.txt"), b"ignored").unwrap();
        data
    }

    #[test]
    fn test_batch_isolates_failures() {
        for threads in [1, 3] {
            let dir = tempfile::tempdir().unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let data = data_dir(dir.path());
            let migrator = migrator(dir.path(), scratch.path(), threads);

            let request = MigrationRequest {
                source: data.clone(),
                ..Default::default()
            };
            let err = migrator.migrate_auto(&request).unwrap_err();
            let MigrateError::Batch(report) = err else {
                panic!("expected a batch error, threads = {threads}");
            };

            assert_eq!(report.total(), 3);
            let succeeded: Vec<_> = report.succeeded.iter().map(|(p, _)| p.clone()).collect();
            assert_eq!(succeeded, vec![data.join("alpha.mv.db"), data.join("gamma.mv.db")]);
            assert_eq!(report.failed.len(), 1);
            assert_eq!(report.failed[0].0, data.join("beta.mv.db"));
            assert!(matches!(report.failed[0].1, MigrateError::NoCompatibleReader { .. }));

            assert_eq!(written_by(&data.join("alpha.201.mv.db")), 2_000_201);
            assert_eq!(written_by(&data.join("gamma.201.mv.db")), 2_000_201);

            let text = report.to_string();
            assert!(text.starts_with("Migrated 2 of 3 databases"));
            assert!(text.contains("FAILED"));
            assert!(text.contains("beta.mv.db"));
        }
    }

    #[test]
    fn test_batch_all_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let data = data_dir(dir.path());
        fs::remove_file(data.join("beta.mv.db")).unwrap();
        let migrator = migrator(dir.path(), scratch.path(), 2);

        let request = MigrationRequest {
            source: data.clone(),
            ..Default::default()
        };
        match migrator.migrate_auto(&request).unwrap() {
            AutoOutcome::Batch(report) => {
                assert_eq!(report.succeeded.len(), 2);
                assert!(report.failed.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_batch_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let data = data_dir(dir.path());
        let migrator = migrator(dir.path(), scratch.path(), 2);
        migrator
            .interrupt_token()
            .store(true, std::sync::atomic::Ordering::Release);

        let request = MigrationRequest {
            source: data.clone(),
            ..Default::default()
        };
        assert!(migrator.migrate_auto(&request).unwrap_err().is_interrupted());
        assert!(!data.join("alpha.201.mv.db").exists());
    }

    #[test]
    fn test_batch_reports_panicking_file() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let data = data_dir(dir.path());
        fs::remove_file(data.join("beta.mv.db")).unwrap();

        let drivers = dir.path().join("drivers");
        fs::create_dir_all(&drivers).unwrap();
        let registry = Registry::from_records(["1.4.200", "2.0.201"].iter().map(|v| driver(&drivers, v)));
        let launcher = Arc::new(FakeLauncher::new());
        launcher.set_behavior(
            "1.4.200",
            FakeBehavior {
                after_dump: Some(Arc::new(|| panic!("driver blew up"))),
                ..Default::default()
            },
        );
        let loader = IsolationLoader::new(
            launcher,
            Arc::new(ScratchDir::new(scratch.path().to_path_buf()).unwrap()),
            QuirkTable::empty(),
        );
        let migrator = Migrator::new(Arc::new(registry), Arc::new(loader)).with_batch_threads(1);

        let request = MigrationRequest {
            source: data.clone(),
            ..Default::default()
        };
        let MigrateError::Batch(report) = migrator.migrate_auto(&request).unwrap_err() else {
            panic!("expected a batch error");
        };

        // Both files are reported even though the single worker panicked on each
        assert_eq!(report.total(), 2);
        assert!(report.succeeded.is_empty());
        let failed: Vec<_> = report.failed.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(failed, vec![data.join("alpha.mv.db"), data.join("gamma.mv.db")]);
        assert!(report.failed[0].1.to_string().contains("driver blew up"));
    }
}

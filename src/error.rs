use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::batch::BatchReport;
use crate::migrator::Stage;
use crate::verify::Recommendation;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into MigrateError automatically

    #[error("Version resolution error: {0}")]
    Resolution(String),

    #[error("Failed to load H2-{version}: {reason}")]
    Load { version: String, reason: String },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("{stage} failed for {} with H2-{version}: {source}", .path.display())]
    Stage {
        stage: Stage,
        version: String,
        path: PathBuf,
        #[source]
        source: Box<MigrateError>,
    },

    #[error("The database file {} exists already and should not be overwritten automatically", .0.display())]
    Conflict(PathBuf),

    #[error("The database file {} points to an existing folder or irregular file", .0.display())]
    IrregularTarget(PathBuf),

    #[error("Unsupported source {}: expected *.mv.db, *.h2.db, *.sql, *.sql.gz or *.sql.zip", .0.display())]
    UnsupportedSource(PathBuf),

    #[error("No compatible reader found for {}: exporting failed with H2 drivers {}", .path.display(), .tried.join(", "))]
    NoCompatibleReader { path: PathBuf, tried: Vec<String> },

    #[error("Verification found {} issue(s); use --force to migrate anyway", .0.len())]
    Verification(Vec<Recommendation>),

    #[error("{0}")]
    Batch(BatchReport),

    #[error("Migration interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(#[from] flexi_logger::FlexiLoggerError),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl MigrateError {
    /// Wraps a lower level error with the pipeline stage, driver version and
    /// file it occurred in. Interruptions, verification findings and already
    /// wrapped errors pass through.
    pub fn in_stage(self, stage: Stage, version: &str, path: impl Into<PathBuf>) -> Self {
        match self {
            MigrateError::Interrupted | MigrateError::Verification(_) | MigrateError::Stage { .. } => self,
            other => MigrateError::Stage {
                stage,
                version: version.to_owned(),
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, MigrateError::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_stage_wraps_with_context() {
        let err = MigrateError::Engine("Table FOO not found".into()).in_stage(
            Stage::Export,
            "1.4.200",
            "/data/test.mv.db",
        );
        let text = err.to_string();
        assert!(text.contains("EXPORT"));
        assert!(text.contains("H2-1.4.200"));
        assert!(text.contains("/data/test.mv.db"));
        assert!(text.contains("Table FOO not found"));
    }

    #[test]
    fn test_in_stage_keeps_interrupt_and_existing_context() {
        let err = MigrateError::Interrupted.in_stage(Stage::Import, "2.0.201", "x");
        assert!(err.is_interrupted());

        let inner = MigrateError::Engine("boom".into()).in_stage(Stage::Import, "2.0.201", "a");
        let outer = inner.in_stage(Stage::Finalize, "1.4.200", "b");
        match outer {
            MigrateError::Stage { stage, version, .. } => {
                assert_eq!(stage, Stage::Import);
                assert_eq!(version, "2.0.201");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

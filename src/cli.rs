use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use directories::ProjectDirs;
use log::info;
use serde_json::json;

use crate::batch::BatchReport;
use crate::config::{Config, MigrationConfig, CONFIG};
use crate::engine::{Credentials, JvmLauncher};
use crate::error::MigrateError;
use crate::loader::{IsolationLoader, QuirkTable};
use crate::migrator::{AutoOutcome, MigrationRequest, MigrationResult, Migrator};
use crate::paths::{absolute_path, Compression};
use crate::registry::Registry;
use crate::scratch::ScratchDir;
use crate::verify::Recommendation;
use crate::version::BuildTags;

#[derive(Parser, Debug)]
#[command(
    name = "h2migrate",
    version,
    about = "h2migrate: migrates H2 databases between incompatible driver versions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct DriverArgs {
    /// Folder or jar with H2 drivers (repeatable, searched recursively)
    #[arg(short = 'l', long = "lib-dir")]
    pub lib_dirs: Vec<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct MigrationArgs {
    /// The database file (*.mv.db, *.h2.db), script (*.sql, *.sql.gz, *.sql.zip) or, in auto mode, a folder
    #[arg(short = 'd', long = "db-file")]
    pub db_file: String,

    /// Version (1.4.200) or release line (2.0) to migrate to (default: newest found)
    #[arg(short = 't', long = "version-to")]
    pub version_to: Option<String>,

    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    #[arg(short = 'p', long = "password")]
    pub password: Option<String>,

    /// Script file written by the export (default: <dbname>.sql next to the database)
    #[arg(short = 's', long = "script-file")]
    pub script_file: Option<String>,

    #[arg(
        short = 'c',
        long = "compression",
        ignore_case = true,
        value_parser = clap::builder::PossibleValuesParser::new(["ZIP", "GZIP"])
    )]
    pub compression: Option<String>,

    /// Upgrade options for the import, e.g. FROM_1X, VARIABLE_BINARY (repeatable)
    #[arg(short = 'o', long = "options")]
    pub options: Vec<String>,

    /// Extra connection settings appended to the database URL, e.g. MODE=Oracle
    #[arg(long = "params")]
    pub params: Option<String>,

    /// Overwrite existing target files and continue despite verification findings
    #[arg(long = "force", default_value_t = false)]
    pub force: bool,

    /// Check the source for column definitions that won't survive the migration
    #[arg(long = "verify", default_value_t = false)]
    pub verify: bool,

    /// Print the result as JSON
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate a database with explicit source and target versions
    Migrate {
        /// Version (1.4.200) or release line (1.4) that wrote the database
        #[arg(short = 'f', long = "version-from")]
        version_from: String,

        #[command(flatten)]
        drivers: DriverArgs,

        #[command(flatten)]
        migration: MigrationArgs,
    },

    /// Migrate a database, or every database in a folder, trying source versions newest first
    Auto {
        #[command(flatten)]
        drivers: DriverArgs,

        #[command(flatten)]
        migration: MigrationArgs,
    },

    /// Dump a damaged database with a driver's recovery tool
    Recover {
        #[arg(short = 'f', long = "version-from")]
        version_from: String,

        /// The damaged *.mv.db or *.h2.db file
        #[arg(short = 'd', long = "db-file")]
        db_file: String,

        #[command(flatten)]
        drivers: DriverArgs,

        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Check a database for column definitions that won't survive a migration
    Verify {
        #[arg(short = 'f', long = "version-from")]
        version_from: String,

        #[arg(short = 'd', long = "db-file")]
        db_file: String,

        #[arg(short = 'u', long = "user")]
        user: Option<String>,

        #[arg(short = 'p', long = "password")]
        password: Option<String>,

        #[command(flatten)]
        drivers: DriverArgs,

        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// List the H2 driver versions that were found
    Versions {
        #[command(flatten)]
        drivers: DriverArgs,

        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },
}

impl MigrationArgs {
    /// Builds a request from the command line, falling back to the
    /// configured defaults for everything not given
    pub fn to_request(&self, from: Option<String>, defaults: &MigrationConfig) -> Result<MigrationRequest, MigrateError> {
        let compression = match &self.compression {
            Some(name) => Compression::from_str(name)
                .map_err(|_| MigrateError::Error(format!("Unknown compression '{name}'")))?,
            None => defaults.compression(),
        };
        let options = if self.options.is_empty() {
            &defaults.options
        } else {
            &self.options
        };

        Ok(MigrationRequest {
            from,
            to: self.version_to.clone(),
            source: absolute_path(&self.db_file)?,
            credentials: Credentials::new(
                self.user.clone().unwrap_or_else(|| defaults.user.clone()),
                self.password.clone().unwrap_or_else(|| defaults.password.clone()),
            ),
            script: self.script_file.as_deref().map(absolute_path).transpose()?,
            compression,
            upgrade_options: options.join(" "),
            connection_params: self.params.clone().unwrap_or_default(),
            overwrite: self.force,
            force: self.force,
            verify: self.verify,
        })
    }
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs, interrupt_token: Arc<AtomicBool>) -> Result<(), MigrateError> {
        let args = Cli::parse();
        let config = CONFIG
            .get()
            .ok_or_else(|| MigrateError::Config("Configuration was not loaded".into()))?;

        match args.command {
            Command::Migrate {
                version_from,
                drivers,
                migration,
            } => {
                let migrator = build_migrator(config, project_dirs, &drivers, interrupt_token)?;
                let request = migration.to_request(Some(version_from), &config.migration)?;
                let result = migrator.migrate(&request)?;
                print_result(&result, migration.json)
            }
            Command::Auto { drivers, migration } => {
                let migrator = build_migrator(config, project_dirs, &drivers, interrupt_token)?;
                let request = migration.to_request(None, &config.migration)?;
                match migrator.migrate_auto(&request) {
                    Ok(AutoOutcome::Single(result)) => print_result(&result, migration.json),
                    Ok(AutoOutcome::Batch(report)) => print_batch(&report, migration.json),
                    Err(MigrateError::Batch(report)) => {
                        if migration.json {
                            print_batch(&report, true)?;
                        }
                        Err(MigrateError::Batch(report))
                    }
                    Err(e) => Err(e),
                }
            }
            Command::Recover {
                version_from,
                db_file,
                drivers,
                json,
            } => {
                let migrator = build_migrator(config, project_dirs, &drivers, interrupt_token)?;
                let record = migrator.registry().resolve(&version_from)?.clone();
                let db_file = absolute_path(&db_file)?;
                let (folder, name) = split_file(&db_file)?;
                let result = migrator.recover(&record, folder, &name)?;
                print_result(&result, json)
            }
            Command::Verify {
                version_from,
                db_file,
                user,
                password,
                drivers,
                json,
            } => {
                let migrator = build_migrator(config, project_dirs, &drivers, interrupt_token)?;
                let record = migrator.registry().resolve(&version_from)?.clone();
                let credentials = Credentials::new(
                    user.unwrap_or_else(|| config.migration.user.clone()),
                    password.unwrap_or_else(|| config.migration.password.clone()),
                );
                let recommendations = migrator.verify_source(&record, &absolute_path(&db_file)?, &credentials)?;
                print_recommendations(&recommendations, json)
            }
            Command::Versions { drivers, json } => {
                let migrator = build_migrator(config, project_dirs, &drivers, interrupt_token)?;
                let registry = migrator.registry();
                if json {
                    let records: Vec<_> = registry.records().collect();
                    println!("{}", to_json(&records)?);
                } else if registry.is_empty() {
                    println!("No H2 drivers found");
                } else {
                    for record in registry.descending() {
                        println!("{:<24} {}", record.to_string(), record.locator());
                    }
                }
                Ok(())
            }
        }
    }
}

/// Wires the driver launcher, loader and registry from the configuration
fn build_migrator(
    config: &Config,
    project_dirs: &ProjectDirs,
    drivers: &DriverArgs,
    interrupt_token: Arc<AtomicBool>,
) -> Result<Migrator, MigrateError> {
    let scratch = Arc::new(ScratchDir::new(config.scratch_dir(project_dirs))?);
    let timeout = (config.engine.timeout_secs > 0).then(|| Duration::from_secs(config.engine.timeout_secs));
    let launcher = Arc::new(JvmLauncher::new(
        PathBuf::from(&config.engine.java),
        timeout,
        scratch.work_dir(),
    ));
    let loader = Arc::new(IsolationLoader::new(
        launcher,
        scratch,
        QuirkTable::with_overrides(&config.quirks),
    ));

    let tags = match config.registry.build_tags.as_deref() {
        Some(path) => BuildTags::load(&absolute_path(path)?)?,
        None => BuildTags::default(),
    };

    let locations = drivers
        .lib_dirs
        .iter()
        .chain(config.engine.lib_dirs.iter())
        .map(|dir| absolute_path(dir))
        .collect::<Result<Vec<_>, _>>()?;

    let registry = Registry::discover(&locations, &loader, &tags)?;
    info!("Found {} H2 driver versions", registry.len());

    let hooks_dir = config.hooks.dir.as_deref().map(absolute_path).transpose()?;

    Ok(Migrator::new(Arc::new(registry), loader)
        .with_hooks_dir(hooks_dir)
        .with_interrupt_token(interrupt_token)
        .with_decimal_threshold(config.migration.decimal_threshold)
        .with_batch_threads(config.migration.batch_threads()))
}

fn split_file(path: &Path) -> Result<(&Path, String), MigrateError> {
    match (path.parent(), path.file_name()) {
        (Some(folder), Some(name)) => Ok((folder, name.to_string_lossy().into_owned())),
        _ => Err(MigrateError::UnsupportedSource(path.to_path_buf())),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, MigrateError> {
    serde_json::to_string_pretty(value).map_err(|e| MigrateError::Error(format!("Failed to write JSON: {e}")))
}

fn print_result(result: &MigrationResult, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", to_json(result)?);
        return Ok(());
    }

    if let Some(from) = &result.from_version {
        println!("Read with:  H2-{from}");
    }
    println!("Script:     {}", result.script_path.display());
    if let (Some(to), Some(database)) = (&result.to_version, &result.database_path) {
        println!("Written by: H2-{to}");
        println!("Database:   {}", database.display());
    }
    for command in &result.commands {
        println!("Replayed:   {command}");
    }
    print_recommendations(&result.recommendations, false)
}

fn print_batch(report: &BatchReport, json: bool) -> Result<(), MigrateError> {
    if json {
        let value = json!({
            "succeeded": report.succeeded.iter().map(|(_, r)| r).collect::<Vec<_>>(),
            "failed": report
                .failed
                .iter()
                .map(|(path, e)| json!({ "source": path, "error": e.to_string() }))
                .collect::<Vec<_>>(),
        });
        println!("{}", to_json(&value)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

fn print_recommendations(recommendations: &[Recommendation], json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", to_json(recommendations)?);
    } else {
        for recommendation in recommendations {
            println!("{recommendation}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_migrate_parsing() {
        let cli = Cli::try_parse_from([
            "h2migrate", "migrate", "-l", "/opt/h2", "-l", "/usr/share/java", "-f", "1.4.200", "-t", "2.0",
            "-d", "/data/test.mv.db", "-c", "gzip", "-o", "FROM_1X", "-o", "VARIABLE_BINARY", "--force",
        ])
        .unwrap();

        let Command::Migrate {
            version_from,
            drivers,
            migration,
        } = cli.command
        else {
            panic!("expected migrate");
        };
        assert_eq!(version_from, "1.4.200");
        assert_eq!(drivers.lib_dirs, vec!["/opt/h2", "/usr/share/java"]);
        assert_eq!(migration.version_to.as_deref(), Some("2.0"));
        assert_eq!(migration.options, vec!["FROM_1X", "VARIABLE_BINARY"]);
        assert!(migration.force);
        assert!(!migration.verify);
    }

    #[test]
    fn test_parsing_rejects_bad_input() {
        // migrate needs a source version
        assert!(Cli::try_parse_from(["h2migrate", "migrate", "-d", "/data/test.mv.db"]).is_err());
        assert!(Cli::try_parse_from(["h2migrate", "auto", "-d", "x.mv.db", "-c", "bzip2"]).is_err());
        assert!(Cli::try_parse_from(["h2migrate", "auto"]).is_err());
        assert!(Cli::try_parse_from(["h2migrate", "serve"]).is_err());
    }

    #[test]
    fn test_other_commands_parse() {
        assert!(matches!(
            Cli::try_parse_from(["h2migrate", "versions", "--json"]).unwrap().command,
            Command::Versions { json: true, .. }
        ));
        assert!(matches!(
            Cli::try_parse_from(["h2migrate", "recover", "-f", "1.4.200", "-d", "/data/test.mv.db"])
                .unwrap()
                .command,
            Command::Recover { .. }
        ));
        assert!(matches!(
            Cli::try_parse_from(["h2migrate", "verify", "-f", "1.4", "-d", "/data/test.mv.db", "-u", "admin"])
                .unwrap()
                .command,
            Command::Verify { user: Some(_), .. }
        ));
    }

    #[test]
    fn test_request_uses_configured_defaults() {
        let mut defaults = Config::default().migration;
        defaults.options = vec!["QUIRKS_MODE".into()];

        let args = MigrationArgs {
            db_file: "/data/test.mv.db".into(),
            password: Some("secret".into()),
            ..Default::default()
        };
        let request = args.to_request(None, &defaults).unwrap();
        assert_eq!(request.source, PathBuf::from("/data/test.mv.db"));
        assert_eq!(request.credentials.user, "SA");
        assert_eq!(request.credentials.password, "secret");
        assert_eq!(request.compression, Compression::None);
        assert_eq!(request.upgrade_options, "QUIRKS_MODE");
        assert!(!request.overwrite);

        let args = MigrationArgs {
            compression: Some("ZIP".into()),
            options: vec!["FROM_1X".into()],
            force: true,
            ..args
        };
        let request = args.to_request(Some("1.4".into()), &defaults).unwrap();
        assert_eq!(request.from.as_deref(), Some("1.4"));
        assert_eq!(request.compression, Compression::Zip);
        assert_eq!(request.upgrade_options, "FROM_1X");
        assert!(request.overwrite && request.force);
    }

    #[test]
    fn test_split_file() {
        let (folder, name) = split_file(Path::new("/data/test.mv.db")).unwrap();
        assert_eq!(folder, Path::new("/data"));
        assert_eq!(name, "test.mv.db");
    }
}

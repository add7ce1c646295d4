use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::paths::Compression;
use crate::verify::DEFAULT_DECIMAL_THRESHOLD;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

/// Environment variables with this prefix override the config file, with
/// `__` separating section and key: `H2MIGRATE_MIGRATION__BATCH_THREADS=4`
const ENV_PREFIX: &str = "H2MIGRATE_";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub h2migrate: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const H2MIGRATE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            h2migrate: Self::H2MIGRATE_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.h2migrate.clone();
        self.h2migrate = self.h2migrate.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.h2migrate.as_str()) {
            eprintln!(
                "Config error: h2migrate log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::H2MIGRATE_LEVEL
            );
            self.h2migrate = Self::H2MIGRATE_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// The java executable used to run driver tools
    pub java: String,
    /// Seconds before a driver tool is killed; 0 waits forever
    pub timeout_secs: u64,
    /// Where bundled drivers are extracted; defaults to the data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<String>,
    /// Directories or jars searched for drivers in addition to `-l`
    #[serde(default)]
    pub lib_dirs: Vec<String>,
}

impl EngineConfig {
    const JAVA: &str = "java";

    fn default() -> Self {
        EngineConfig {
            java: Self::JAVA.to_owned(),
            timeout_secs: 0,
            scratch_dir: None,
            lib_dirs: Vec::new(),
        }
    }

    fn ensure_valid(&mut self) {
        if self.java.trim().is_empty() {
            eprintln!(
                "Config error: java executable is empty - using default of '{}'",
                Self::JAVA
            );
            self.java = Self::JAVA.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Chronological list of known build ids, oldest first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_tags: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HooksConfig {
    /// Holds `<version>/{export,import,init}/*.sql`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MigrationConfig {
    pub user: String,
    pub password: String,
    compression: String,
    #[serde(default)]
    pub options: Vec<String>,
    batch_threads: usize,
    pub decimal_threshold: u64,
}

impl MigrationConfig {
    const USER: &str = "SA";
    const BATCH_THREADS: usize = 2;

    pub fn compression(&self) -> Compression {
        // Validated in ensure_valid
        Compression::from_str(&self.compression).unwrap_or_default()
    }

    pub fn batch_threads(&self) -> usize {
        self.batch_threads
    }

    fn default() -> Self {
        MigrationConfig {
            user: Self::USER.to_owned(),
            password: String::new(),
            compression: Compression::None.to_string(),
            options: Vec::new(),
            batch_threads: Self::BATCH_THREADS,
            decimal_threshold: DEFAULT_DECIMAL_THRESHOLD,
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.compression.clone();
        self.compression = self.compression.trim().to_ascii_uppercase();
        if Compression::from_str(&self.compression).is_err() {
            eprintln!(
                "Config error: compression of '{}' is invalid - using default of '{}'",
                str_original,
                Compression::None
            );
            self.compression = Compression::None.to_string();
        }

        if self.batch_threads == 0 {
            eprintln!(
                "Config error: batch_threads must be at least 1 - using default of {}",
                Self::BATCH_THREADS
            );
            self.batch_threads = Self::BATCH_THREADS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    pub migration: MigrationConfig,
    /// Version (full, `major.minor` or major) → classes to resolve right after loading
    #[serde(default)]
    pub quirks: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            engine: EngineConfig::default(),
            registry: RegistryConfig::default(),
            hooks: HooksConfig::default(),
            migration: MigrationConfig::default(),
            quirks: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from `config.toml` in the app's data
    /// directory, with environment overrides. If the file is missing it is
    /// written with the defaults; if it fails to parse, defaults are used.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        if !config_path.exists() {
            Self::write_default(&config_path);
        }

        Self::load_from(&config_path)
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    /// Defaults, then the TOML file (if it exists), then the environment
    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut config = Self::figment(config_path).extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            Config::default()
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.engine.ensure_valid();
        self.migration.ensure_valid();
    }

    /// The directory bundled drivers are extracted to
    pub fn scratch_dir(&self, project_dirs: &ProjectDirs) -> PathBuf {
        self.engine
            .scratch_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| project_dirs.data_local_dir().join("scratch"))
    }
}

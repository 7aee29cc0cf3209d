use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::services::document_emitter::EmissionStrategy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_ZOMBIE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ZOMBIE_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_EMISSION_MODE: &str = "migration";
const DEFAULT_EMISSION_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host
    #[validate(length(min = 1))]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Runtime environment name (development, staging, production)
    #[validate(length(min = 1))]
    pub environment: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Apply pending migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Inactivity after which an in-progress or emitting session is a zombie
    #[serde(default = "default_zombie_timeout_secs")]
    #[validate(custom = "validate_zombie_timeout")]
    pub zombie_timeout_secs: u64,

    /// How often the background sweeper looks for zombies
    #[serde(default = "default_zombie_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub zombie_sweep_interval_secs: u64,

    /// Let the sweeper recover zombies instead of only reporting them
    #[serde(default)]
    pub zombie_auto_recover: bool,

    /// `live` calls the document emission service, `migration` skips it
    #[serde(default = "default_emission_mode")]
    #[validate(custom = "validate_emission_mode")]
    pub emission_mode: String,

    /// Base URL of the document emission service
    #[serde(default)]
    pub emission_service_url: Option<String>,

    #[serde(default = "default_emission_timeout_secs")]
    #[validate(range(min = 1))]
    pub emission_timeout_secs: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            zombie_timeout_secs: default_zombie_timeout_secs(),
            zombie_sweep_interval_secs: default_zombie_sweep_interval_secs(),
            zombie_auto_recover: false,
            emission_mode: default_emission_mode(),
            emission_service_url: None,
            emission_timeout_secs: default_emission_timeout_secs(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_secs(self.zombie_timeout_secs)
    }

    pub fn zombie_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_sweep_interval_secs)
    }

    pub fn emission_timeout(&self) -> Duration {
        Duration::from_secs(self.emission_timeout_secs)
    }

    /// Emission strategy selected by `emission_mode`. Validation guarantees the mode is known.
    pub fn emission_strategy(&self) -> EmissionStrategy {
        if self.emission_mode.eq_ignore_ascii_case("live") {
            EmissionStrategy::Live
        } else {
            EmissionStrategy::Migration
        }
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let has_url = self
            .emission_service_url
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false);
        if self.emission_strategy() == EmissionStrategy::Live && !has_url {
            let mut err = ValidationError::new("emission_service_url_required");
            err.message = Some(
                "Set APP__EMISSION_SERVICE_URL when emission_mode is 'live', or use emission_mode = 'migration'".into(),
            );
            errors.add("emission_service_url", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Runs field validation and the cross-field checks
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        self.validate_additional_constraints()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_zombie_timeout_secs() -> u64 {
    DEFAULT_ZOMBIE_TIMEOUT_SECS
}

fn default_zombie_sweep_interval_secs() -> u64 {
    DEFAULT_ZOMBIE_SWEEP_INTERVAL_SECS
}

fn default_emission_mode() -> String {
    DEFAULT_EMISSION_MODE.to_string()
}

fn default_emission_timeout_secs() -> u64 {
    DEFAULT_EMISSION_TIMEOUT_SECS
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_emission_mode(mode: &str) -> Result<(), ValidationError> {
    match mode.to_ascii_lowercase().as_str() {
        "live" | "migration" => Ok(()),
        _ => {
            let mut err = ValidationError::new("emission_mode");
            err.message = Some("Must be one of: live, migration".into());
            Err(err)
        }
    }
}

fn validate_zombie_timeout(secs: u64) -> Result<(), ValidationError> {
    if secs == 0 {
        let mut err = ValidationError::new("zombie_timeout_secs");
        err.message = Some("zombie_timeout_secs must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stockkeeper={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

/// Same as [`load_config`] with an explicit config directory
pub fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://stockkeeper.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

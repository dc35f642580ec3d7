// Configuration module for mediatracker
// Resolves XDG directories, reads config.toml and applies environment overrides

use serde::Deserialize;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "mediatracker";
const CONFIG_FILENAME: &str = "config.toml";
const DATABASE_FILENAME: &str = "data.db";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerConfig,

    /// Directory paths (overrides XDG defaults)
    pub paths: PathsConfig,

    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server port (default: 7481)
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7481,
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Override data directory (database location)
    pub data_dir: Option<PathBuf>,

    /// Override the database file itself
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Minutes between release notification runs (default: 60, 0 to disable)
    pub notifications_interval_minutes: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            notifications_interval_minutes: 60,
        }
    }
}

/// Directories the server reads from and writes to
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// XDG: $XDG_CONFIG_HOME/mediatracker or ~/.config/mediatracker
    pub config_dir: PathBuf,

    /// XDG: $XDG_DATA_HOME/mediatracker or ~/.local/share/mediatracker
    pub data_dir: PathBuf,

    pub database_path: PathBuf,
}

impl AppPaths {
    /// Priority: environment, then config file, then XDG, then the current directory
    pub fn new(overrides: &PathsConfig) -> Self {
        let config_dir = find_config_dir();
        let data_dir = env_path("MEDIATRACKER_DATA_DIR")
            .or_else(|| overrides.data_dir.clone())
            .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_NAME)))
            .unwrap_or_else(current_dir);
        let database_path = env_path("DATABASE_PATH")
            .or_else(|| overrides.database_path.clone())
            .unwrap_or_else(|| data_dir.join(DATABASE_FILENAME));

        Self {
            config_dir,
            data_dir,
            database_path,
        }
    }

    /// Everything under the current directory
    pub fn current_dir() -> Self {
        let cwd = current_dir();
        Self {
            config_dir: cwd.clone(),
            database_path: env_path("DATABASE_PATH").unwrap_or_else(|| cwd.join(DATABASE_FILENAME)),
            data_dir: cwd,
        }
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.database_path.display())
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        if let Some(parent) = self.database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub fn log_paths(&self) {
        tracing::info!("Configuration directory: {}", self.config_dir.display());
        tracing::info!("Data directory: {}", self.data_dir.display());
        tracing::debug!("Database path: {}", self.database_path.display());
    }
}

/// Application configuration - TOML file with environment overrides
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub paths: AppPaths,
    pub port: u16,
    pub bind_address: String,
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// Load configuration from TOML file and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML config file
    /// 3. Default values
    pub fn load() -> Self {
        let portable_mode = std::env::var("MEDIATRACKER_PORTABLE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if portable_mode {
            tracing::info!("Running in portable mode (using current directory)");
            return Self::portable();
        }

        let config_file = load_config_file(&find_config_dir());
        Self::build(config_file)
    }

    pub fn portable() -> Self {
        let defaults = ServerConfig::default();
        Self {
            paths: AppPaths::current_dir(),
            port: env_port().unwrap_or(defaults.port),
            bind_address: env_bind_address().unwrap_or(defaults.bind_address),
            jobs: JobsConfig::default(),
        }
    }

    fn build(config_file: ConfigFile) -> Self {
        Self {
            paths: AppPaths::new(&config_file.paths),
            port: env_port().unwrap_or(config_file.server.port),
            bind_address: env_bind_address().unwrap_or(config_file.server.bind_address),
            jobs: config_file.jobs,
        }
    }

    /// Get the database URL, with override from DATABASE_URL env var
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.paths.database_url())
    }

    pub fn log_config(&self) {
        self.paths.log_paths();
        tracing::info!("Server listening on {}:{}", self.bind_address, self.port);

        if self.jobs.notifications_interval_minutes > 0 {
            tracing::info!(
                "Release notifications every {} minutes",
                self.jobs.notifications_interval_minutes
            );
        } else {
            tracing::info!("Release notifications disabled (interval set to 0)");
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::build(ConfigFile::default())
    }
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn find_config_dir() -> PathBuf {
    env_path("MEDIATRACKER_CONFIG_DIR")
        .or_else(|| dirs::config_dir().map(|dir| dir.join(APP_NAME)))
        .unwrap_or_else(current_dir)
}

fn env_port() -> Option<u16> {
    std::env::var("PORT").ok().and_then(|p| p.parse().ok())
}

fn env_bind_address() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

/// A missing or unreadable file falls back to defaults
fn load_config_file(config_dir: &Path) -> ConfigFile {
    let config_path = config_dir.join(CONFIG_FILENAME);

    if !config_path.exists() {
        tracing::debug!(
            "No config file found at {}, using defaults",
            config_path.display()
        );
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config file {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                "Failed to read config file {}: {}. Using defaults.",
                config_path.display(),
                e
            );
            ConfigFile::default()
        }
    }
}

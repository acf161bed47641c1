// Required external crates for configuration management and serialization
use serde::Deserialize;
use std::path::{Path, PathBuf};
use config::{Config, ConfigError, Environment, File};

/// Configuration for the native engine handle
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Path of the engine config file handed to the native create call
    pub config_path: String,
    /// Optional JSON payload applied through `configure` before load
    #[serde(default)]
    pub extra_config: Option<String>,
    /// Whether the chat template should enable thinking mode
    #[serde(default)]
    pub thinking: bool,
    /// Run backend tuning right after a successful load
    #[serde(default)]
    pub tune_on_load: bool,
}

/// Image size used for vision prompts. Zero keeps the model default.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VisionConfig {
    #[serde(default)]
    pub image_width: u32,
    #[serde(default)]
    pub image_height: u32,
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Optional log directory
    pub file: Option<PathBuf>,
}

/// Main settings struct that contains all configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Engine-related settings
    pub engine: EngineConfig,
    /// Vision prompt settings
    #[serde(default)]
    pub vision: VisionConfig,
    /// Logging-related settings
    pub logging: LoggingConfig,
}

/// Implementation for loading and parsing configuration
impl Settings {
    /// Loads settings from the `config` directory under the working directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = std::env::current_dir()
            .map_err(|e| ConfigError::Message(
                format!("Failed to get current directory: {}", e)
            ))?
            .join("config");
        Self::from_dir(config_dir)
    }

    /// Loads settings from `config_dir` in the following order of precedence
    /// (highest to lowest):
    /// 1. Environment variables prefixed with NATIVE_LLM_ (nested keys split by `__`)
    /// 2. Local config file (local.toml) if present
    /// 3. Default config file (default.toml)
    pub fn from_dir(config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        if !config_dir.exists() {
            return Err(ConfigError::Message(
                format!("Config directory not found at: {}", config_dir.display())
            ));
        }

        let default_config = config_dir.join("default.toml");
        if !default_config.exists() {
            return Err(ConfigError::Message(
                format!("Default configuration file not found at: {}", default_config.display())
            ));
        }
        let local_config = config_dir.join("local.toml");

        let settings = Config::builder()
            .add_source(File::from(default_config))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix("NATIVE_LLM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.config_path.trim().is_empty() {
            return Err(ConfigError::Message(
                "engine.config_path must not be empty".to_string()
            ));
        }

        // The payload is passed through verbatim, but a typo should fail here
        // rather than inside the native layer
        if let Some(extra) = &self.engine.extra_config {
            serde_json::from_str::<serde_json::Value>(extra).map_err(|e| {
                ConfigError::Message(format!("engine.extra_config is not valid JSON: {}", e))
            })?;
        }

        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(ConfigError::Message(
                format!("Invalid logging level: {}. Must be one of: error, warn, info, debug, trace",
                    self.logging.level)
            )),
        }?;

        if let Some(log_dir) = &self.logging.file {
            if !log_dir.exists() {
                std::fs::create_dir_all(log_dir).map_err(|e| {
                    ConfigError::Message(format!(
                        "Failed to create log directory at {}: {}",
                        log_dir.display(), e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

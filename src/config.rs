//! Runtime configuration for image-forge.
//!
//! Configuration is assembled in three layers: built-in defaults, an optional
//! YAML file, then `FORGE_*` environment overrides. Every section has a
//! `Default` so a bare `ForgeConfig::default()` is usable in tests.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML file could not be parsed.
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prompt refinement and sampling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Inclusive `[min, max]` range sampled uniformly for each task's temperature.
    pub temperature_range: [f64; 2],
    /// Inclusive `[min, max]` range sampled uniformly for each task's top_p.
    pub top_p_range: [f64; 2],
    /// When enabled, tasks run serially and each prompt is derived from the
    /// previous task's refined prompt.
    pub prompt_inheritance: bool,
    /// Change ratio handed to `refine_delta` in serial mode.
    pub prompt_delta_ratio: f64,
    pub default_style: String,
    pub default_negative_prompt: String,
    /// System role text prepended to refinement instructions.
    pub role: String,
    /// Fixed RNG seed for reproducible sampling. `None` seeds from entropy.
    pub sampling_seed: Option<u64>,
    /// Use the unrefined prompt when refinement fails instead of failing the job.
    pub refine_fallback: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature_range: [1.0, 1.0],
            top_p_range: [0.8, 0.8],
            prompt_inheritance: false,
            prompt_delta_ratio: 0.1,
            default_style: String::new(),
            default_negative_prompt: "low quality, blurry, distorted, watermark, text".to_string(),
            role: "You are an expert prompt engineer for text-to-image models.".to_string(),
            sampling_seed: None,
            refine_fallback: true,
        }
    }
}

/// Sizes of the two execution pools used in parallel mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub default_workers: usize,
    pub image_workers: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_workers: 4,
            image_workers: 8,
        }
    }
}

/// Append-log layout and writer/archiver timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    pub raw_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub enqueue_timeout_ms: u64,
    pub archive_interval_secs: u64,
    /// UTC hour during which the archiver does work.
    pub archive_hour_utc: u32,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            archive_dir: PathBuf::from("data/raw/archive"),
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 500,
            enqueue_timeout_ms: 5_000,
            archive_interval_secs: 3_600,
            archive_hour_utc: 2,
        }
    }
}

impl JournalSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }
}

/// SQLite connection and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite path or `sqlite://` URL.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_backoff_ms: u64,
    /// Queries slower than this are logged at warn level.
    pub slow_query_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://data/records.db".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
            busy_timeout_ms: 5_000,
            lock_retry_attempts: 3,
            lock_retry_backoff_ms: 100,
            slow_query_ms: 30,
        }
    }
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Remote backend endpoints, credentials and artifact output root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub api_key: Option<String>,
    pub wan_api_key: Option<String>,
    pub z_image_api_key: Option<String>,
    pub chat_endpoint: String,
    pub wan_endpoint: String,
    pub z_image_endpoint: String,
    /// Base URL for polling asynchronous tasks; the task id is appended.
    pub task_endpoint: String,
    pub refine_model: String,
    pub wan_model: String,
    pub z_image_model: String,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            wan_api_key: None,
            z_image_api_key: None,
            chat_endpoint: "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions"
                .to_string(),
            wan_endpoint:
                "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generation"
                    .to_string(),
            z_image_endpoint:
                "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generation"
                    .to_string(),
            task_endpoint: "https://dashscope.aliyuncs.com/api/v1/tasks".to_string(),
            refine_model: "qwen-max".to_string(),
            wan_model: "wan2.6-t2i".to_string(),
            z_image_model: "z-image-turbo".to_string(),
            poll_interval_secs: 5,
            poll_timeout_secs: 600,
            request_timeout_secs: 120,
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl BackendSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub generation: GenerationSettings,
    pub pools: PoolSettings,
    pub journal: JournalSettings,
    pub database: DatabaseSettings,
    pub backend: BackendSettings,
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from an optional YAML file, then applies
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Creates configuration from defaults plus environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_PROMPT_INHERITANCE`: Enable serial prompt chaining (default: false)
    /// - `FORGE_PROMPT_DELTA_RATIO`: Change ratio for chained prompts (default: 0.1)
    /// - `FORGE_SAMPLING_SEED`: Fixed RNG seed for sampling
    /// - `FORGE_DEFAULT_WORKERS` / `FORGE_IMAGE_WORKERS`: Pool sizes (default: 4 / 8)
    /// - `FORGE_REFINE_FALLBACK`: Keep the raw prompt when refinement fails (default: true)
    /// - `FORGE_JOURNAL_DIR`: Active append-log directory (default: data/raw)
    /// - `FORGE_ARCHIVE_DIR`: Archive directory (default: data/raw/archive)
    /// - `FORGE_DATABASE_URL`: SQLite database (default: sqlite://data/records.db)
    /// - `FORGE_DB_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `FORGE_OUTPUT_DIR`: Artifact output root (default: outputs)
    /// - `DASHSCOPE_API_KEY`, `WAN_API_KEY`, `Z_IMAGE_API_KEY`: Backend credentials
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("FORGE_PROMPT_INHERITANCE") {
            self.generation.prompt_inheritance = parse_env_bool(&val, "FORGE_PROMPT_INHERITANCE")?;
        }

        if let Ok(val) = std::env::var("FORGE_PROMPT_DELTA_RATIO") {
            self.generation.prompt_delta_ratio = parse_env_value(&val, "FORGE_PROMPT_DELTA_RATIO")?;
        }

        if let Ok(val) = std::env::var("FORGE_SAMPLING_SEED") {
            self.generation.sampling_seed = Some(parse_env_value(&val, "FORGE_SAMPLING_SEED")?);
        }

        if let Ok(val) = std::env::var("FORGE_REFINE_FALLBACK") {
            self.generation.refine_fallback = parse_env_bool(&val, "FORGE_REFINE_FALLBACK")?;
        }

        if let Ok(val) = std::env::var("FORGE_DEFAULT_WORKERS") {
            self.pools.default_workers = parse_env_value(&val, "FORGE_DEFAULT_WORKERS")?;
        }

        if let Ok(val) = std::env::var("FORGE_IMAGE_WORKERS") {
            self.pools.image_workers = parse_env_value(&val, "FORGE_IMAGE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("FORGE_JOURNAL_DIR") {
            self.journal.raw_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("FORGE_ARCHIVE_DIR") {
            self.journal.archive_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("FORGE_DATABASE_URL") {
            self.database.url = val;
        }

        if let Ok(val) = std::env::var("FORGE_DB_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env_value(&val, "FORGE_DB_MAX_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("FORGE_OUTPUT_DIR") {
            self.backend.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("DASHSCOPE_API_KEY") {
            self.backend.api_key = Some(val);
        }

        if let Ok(val) = std::env::var("WAN_API_KEY") {
            self.backend.wan_api_key = Some(val);
        }

        if let Ok(val) = std::env::var("Z_IMAGE_API_KEY") {
            self.backend.z_image_api_key = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.generation;
        for (name, [lo, hi]) in [
            ("temperature_range", g.temperature_range),
            ("top_p_range", g.top_p_range),
        ] {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be a finite [min, max] pair with min <= max",
                    name
                )));
            }
        }

        if !(0.0..=1.0).contains(&g.prompt_delta_ratio) {
            return Err(ConfigError::ValidationFailed(
                "prompt_delta_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.pools.default_workers == 0 || self.pools.image_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool sizes must be greater than 0".to_string(),
            ));
        }

        let j = &self.journal;
        if j.queue_capacity == 0 || j.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "journal queue_capacity and batch_size must be greater than 0".to_string(),
            ));
        }

        if j.archive_hour_utc > 23 {
            return Err(ConfigError::ValidationFailed(
                "archive_hour_utc must be between 0 and 23".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "database max_connections must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ForgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pools.default_workers, 4);
        assert_eq!(config.pools.image_workers, 8);
        assert_eq!(config.journal.queue_capacity, 10_000);
        assert_eq!(config.journal.enqueue_timeout(), Duration::from_secs(5));
        assert_eq!(config.database.max_connections, 10);
        assert!((config.generation.prompt_delta_ratio - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
generation:
  prompt_inheritance: true
  temperature_range: [0.7, 1.2]
journal:
  batch_size: 10
"#;
        let config = ForgeConfig::from_yaml(yaml).expect("yaml should parse");
        assert!(config.generation.prompt_inheritance);
        assert_eq!(config.generation.temperature_range, [0.7, 1.2]);
        assert_eq!(config.generation.top_p_range, [0.8, 0.8]);
        assert_eq!(config.journal.batch_size, 10);
        assert_eq!(config.journal.queue_capacity, 10_000);
    }

    #[test]
    fn test_validation_rejects_inverted_range() {
        let mut config = ForgeConfig::default();
        config.generation.top_p_range = [0.9, 0.1];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_archive_hour() {
        let mut config = ForgeConfig::default();
        config.journal.archive_hour_utc = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("TRUE", "k").unwrap());
        assert!(!parse_env_bool("off", "k").unwrap());
        assert!(parse_env_bool("maybe", "k").is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let n: usize = parse_env_value("8", "k").unwrap();
        assert_eq!(n, 8);
        assert!(parse_env_value::<usize>("eight", "k").is_err());
    }
}

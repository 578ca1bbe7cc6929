//! Typed configuration loaded from YAML with environment overrides.
//!
//! Durations are written as millisecond integers in the file, e.g.
//! `rate_limit: 200` for 200ms.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub workers: WorkersConfig,
    pub bulk: BulkConfig,
    pub strategy: String,
    pub api: ApiConfig,
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub json: JsonConfig,
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub fetchers: usize,
    pub processors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    pub size: usize,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(with = "duration_serde")]
    pub rate_limit: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub page_size: usize,
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(with = "duration_serde", default = "default_elastic_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub skip_tls_verify: bool,
    #[serde(default)]
    pub ca_cert_path: String,
}

fn default_elastic_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonConfig {
    #[serde(default)]
    pub output_dir: String,
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    #[serde(default)]
    pub format: String,
}

fn default_file_pattern() -> String {
    "epss_batch_%d.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_serde")]
    pub delay: Duration,
    pub backoff: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub output_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub file_path: String,
}

impl Config {
    /// Read, parse, apply env overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| IngestError::Config(format!("failed to parse config: {e}")))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("EPSS_ELASTIC_HOSTS") {
            if !val.is_empty() {
                self.elasticsearch.hosts = vec![val];
            }
        }
        if let Ok(val) = std::env::var("EPSS_ELASTIC_USERNAME") {
            if !val.is_empty() {
                self.elasticsearch.username = val;
            }
        }
        if let Ok(val) = std::env::var("EPSS_ELASTIC_PASSWORD") {
            if !val.is_empty() {
                self.elasticsearch.password = val;
            }
        }
        if let Ok(val) = std::env::var("EPSS_ELASTIC_INDEX") {
            if !val.is_empty() {
                self.elasticsearch.index = val;
            }
        }
        if let Ok(val) = std::env::var("EPSS_ELASTIC_SKIP_TLS_VERIFY") {
            if let Ok(b) = val.parse::<bool>() {
                self.elasticsearch.skip_tls_verify = b;
            }
        }
        if let Ok(val) = std::env::var("EPSS_ELASTIC_CA_CERT_PATH") {
            if !val.is_empty() {
                self.elasticsearch.ca_cert_path = val;
            }
        }
        if let Ok(val) = std::env::var("EPSS_WORKERS_FETCHERS") {
            if let Ok(n) = val.parse::<usize>() {
                self.workers.fetchers = n;
            }
        }
        if let Ok(val) = std::env::var("EPSS_WORKERS_PROCESSORS") {
            if let Ok(n) = val.parse::<usize>() {
                self.workers.processors = n;
            }
        }
        if let Ok(val) = std::env::var("EPSS_STRATEGY") {
            if !val.is_empty() {
                self.strategy = val;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers.fetchers == 0 {
            return Err(IngestError::Config("workers.fetchers must be > 0".into()));
        }
        if self.workers.processors == 0 {
            return Err(IngestError::Config("workers.processors must be > 0".into()));
        }
        if self.bulk.size == 0 {
            return Err(IngestError::Config("bulk.size must be > 0".into()));
        }
        if self.strategy != "elasticsearch" && self.strategy != "json" {
            return Err(IngestError::Config(
                "strategy must be 'elasticsearch' or 'json'".into(),
            ));
        }
        if self.api.page_size == 0 {
            return Err(IngestError::Config("api.page_size must be > 0".into()));
        }

        if self.strategy == "elasticsearch" {
            if self.elasticsearch.hosts.is_empty() {
                return Err(IngestError::Config(
                    "elasticsearch.hosts cannot be empty".into(),
                ));
            }
            if self.elasticsearch.index.is_empty() {
                return Err(IngestError::Config(
                    "elasticsearch.index cannot be empty".into(),
                ));
            }
        }

        if self.strategy == "json" {
            if self.json.output_dir.is_empty() {
                return Err(IngestError::Config("json.output_dir cannot be empty".into()));
            }
            if self.json.format != "array" && self.json.format != "ndjson" {
                return Err(IngestError::Config(
                    "json.format must be 'array' or 'ndjson'".into(),
                ));
            }
        }

        Ok(())
    }
}

// Serde helper for Duration (milliseconds in config files)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

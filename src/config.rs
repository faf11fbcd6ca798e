//! Configuration management for the exoplanet classifier

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

/// Artifact cache and remote store
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    /// Local directory holding the artifact triple
    pub cache_dir: PathBuf,
    /// Base URL of the remote artifact store; no downloads when unset
    #[serde(default)]
    pub remote_base_url: Option<String>,
    #[serde(default = "default_classifier_file")]
    pub classifier_file: String,
    #[serde(default = "default_transform_file")]
    pub transform_file: String,
    #[serde(default = "default_codec_file")]
    pub codec_file: String,
    /// Per-request download timeout
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Attempts per file before giving up
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    /// Delay before the first retry, doubled after each failure
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_classifier_file() -> String {
    "classifier.json".to_string()
}

fn default_transform_file() -> String {
    "scaler.json".to_string()
}

fn default_codec_file() -> String {
    "label_codec.json".to_string()
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_download_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl ArtifactsConfig {
    /// Config for a local cache with no remote store
    pub fn local<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            remote_base_url: None,
            classifier_file: default_classifier_file(),
            transform_file: default_transform_file(),
            codec_file: default_codec_file(),
            download_timeout_secs: default_download_timeout_secs(),
            download_retries: default_download_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }

    /// File names of the triple, classifier first
    pub fn file_names(&self) -> [&str; 3] {
        [
            self.classifier_file.as_str(),
            self.transform_file.as_str(),
            self.codec_file.as_str(),
        ]
    }
}

/// Classifier runtime settings
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Intra-op threads for ONNX classifiers (default: 1)
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

fn default_onnx_threads() -> usize {
    1
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            onnx_threads: default_onnx_threads(),
        }
    }
}

/// Request handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Maximum concurrent classifications in the serving binary
    pub workers: usize,
    /// Decimals kept on the returned confidence
    #[serde(default = "default_confidence_decimals")]
    pub confidence_decimals: u32,
    /// Seconds between metrics summaries; 0 disables them
    #[serde(default)]
    pub metrics_interval_secs: u64,
}

fn default_confidence_decimals() -> u32 {
    4
}

/// Log output format
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    #[serde(default)]
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` directives take precedence over the configured level.
    pub fn init_subscriber(&self) -> Result<()> {
        let directive = format!("exoplanet_classifier={}", self.level)
            .parse::<Directive>()
            .with_context(|| format!("Invalid log level `{}`", self.level))?;
        let filter = EnvFilter::from_default_env().add_directive(directive);

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = match self.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
        };
        installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path, then apply
    /// `EXOPLANET__SECTION__KEY` environment overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("EXOPLANET")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            artifacts: ArtifactsConfig::local("artifacts"),
            inference: InferenceConfig::default(),
            service: ServiceConfig {
                workers: 4,
                confidence_decimals: default_confidence_decimals(),
                metrics_interval_secs: 0,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Json,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.artifacts.cache_dir, PathBuf::from("artifacts"));
        assert_eq!(
            config.artifacts.file_names(),
            ["classifier.json", "scaler.json", "label_codec.json"]
        );
        assert!(config.artifacts.remote_base_url.is_none());
        assert_eq!(config.service.confidence_decimals, 4);
        assert_eq!(config.inference.onnx_threads, 1);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_file_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[artifacts]
cache_dir = "/var/cache/exoplanet"
remote_base_url = "https://models.example.org/exoplanet/v1"

[service]
workers = 8

[logging]
level = "debug"
format = "pretty"
"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.artifacts.cache_dir, PathBuf::from("/var/cache/exoplanet"));
        assert_eq!(
            config.artifacts.remote_base_url.as_deref(),
            Some("https://models.example.org/exoplanet/v1")
        );
        assert_eq!(config.artifacts.classifier_file, "classifier.json");
        assert_eq!(config.artifacts.download_retries, 3);
        assert_eq!(config.service.workers, 8);
        assert_eq!(config.service.confidence_decimals, 4);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/config.toml");
        let config = AppConfig::load_from_path(path).unwrap();
        assert_eq!(config.artifacts.transform_file, "scaler.json");
        assert!(config.service.workers > 0);
    }
}

use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration for the handover service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// HTTP listener configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Upload storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// PDF export configuration
    #[serde(default)]
    pub pdf: PdfConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Session secret; overridable via the SECRET_KEY environment variable
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json")
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body size in bytes (bounds photo uploads)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Upload storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding uploaded photos and signatures
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Stored images are downscaled to fit this bound on both axes
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
}

/// PDF export configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PdfConfig {
    /// TrueType font (TTF or TTC) embedded into exported documents.
    /// Deployments serving Hangul point this at a Korean-covering face.
    #[serde(default = "default_font_path")]
    pub font_path: PathBuf,
}

// Default value functions

fn default_service_name() -> String {
    "nabi-handover".to_string()
}

fn default_secret_key() -> String {
    "default_secret_key".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("static/uploads")
}

fn default_max_image_dimension() -> u32 {
    300
}

fn default_font_path() -> PathBuf {
    PathBuf::from("fonts/DejaVuSans.ttf")
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/handover").required(false))
            .add_source(config::File::with_name("/etc/nabi/handover").required(false))
            // Override with environment variables
            // NABI__HTTP__PORT -> http.port
            .add_source(
                config::Environment::with_prefix("NABI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Self = config.try_deserialize()?;

        // SECRET_KEY is honored without the NABI prefix for existing deployments
        if let Ok(secret) = std::env::var("SECRET_KEY") {
            config.service.secret_key = secret;
        }

        Ok(config)
    }

    /// Whether the service is running on the built-in placeholder secret
    pub fn using_default_secret(&self) -> bool {
        self.service.secret_key == default_secret_key()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            secret_key: default_secret_key(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_image_dimension: default_max_image_dimension(),
        }
    }
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            font_path: default_font_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
            pdf: PdfConfig::default(),
        };

        assert_eq!(config.service.name, "nabi-handover");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.storage.max_image_dimension, 300);
        assert_eq!(config.storage.upload_dir, PathBuf::from("static/uploads"));
        assert!(config.using_default_secret());
    }

    #[test]
    fn test_explicit_secret_is_not_default() {
        let mut config = Config {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
            pdf: PdfConfig::default(),
        };
        config.service.secret_key = "s3cr3t".to_string();

        assert!(!config.using_default_secret());
    }
}

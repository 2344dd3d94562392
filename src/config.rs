use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the deposit service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Blob store (S3-compatible) configuration
    pub blob_store: BlobStoreConfig,
    /// Record store (PostgREST) configuration
    pub record_store: RecordStoreConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Blob store configuration for the S3-compatible object store
#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    /// Bucket name for deposit images
    pub bucket: String,
    /// Region ("auto" for Cloudflare R2)
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (R2 account endpoint, MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for R2 and MinIO)
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    /// Signed URL expiration in seconds
    #[serde(default = "default_signed_url_expiry_secs")]
    pub signed_url_expiry_secs: u64,
}

/// Record store configuration for the PostgREST interface
#[derive(Debug, Clone, Deserialize)]
pub struct RecordStoreConfig {
    /// Base URL of the record store (the `/rest/v1` prefix is appended)
    pub base_url: String,
    /// Service role key used for both `apikey` and bearer auth headers
    pub service_role_key: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// API configuration for the inbound deposit endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "deposit-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_signed_url_expiry_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "deposit-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/deposit").required(false))
            .add_source(config::File::with_name("/etc/deposit-service/deposit").required(false))
            // Override with environment variables
            // DEPOSIT__BLOB_STORE__BUCKET -> blob_store.bucket
            .add_source(
                config::Environment::with_prefix("DEPOSIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get signed URL expiry as Duration
    pub fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.blob_store.signed_url_expiry_secs)
    }

    /// Get record store request timeout as Duration
    pub fn record_store_timeout(&self) -> Duration {
        Duration::from_secs(self.record_store.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_region(), "auto");
        assert_eq!(default_signed_url_expiry_secs(), 3600);
        assert!(default_true());
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config {
            service: ServiceConfig::default(),
            blob_store: BlobStoreConfig {
                bucket: "deposits".to_string(),
                region: default_region(),
                endpoint_url: Some("https://account.r2.cloudflarestorage.com".to_string()),
                force_path_style: true,
                signed_url_expiry_secs: 900,
            },
            record_store: RecordStoreConfig {
                base_url: "https://project.supabase.co".to_string(),
                service_role_key: "key".to_string(),
                request_timeout_secs: 10,
            },
            api: ApiConfig::default(),
        };

        assert_eq!(config.signed_url_expiry(), Duration::from_secs(900));
        assert_eq!(config.record_store_timeout(), Duration::from_secs(10));
    }
}

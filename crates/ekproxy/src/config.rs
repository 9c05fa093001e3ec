//! Configuration loading and validation for the proxy.
//!
//! All values are read from environment variables at startup. The process
//! will exit with a clear error message if any required variable is missing
//! or invalid. Durations are in seconds throughout.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::kms::KMS_CONNECTOR_TYPE_REST;

/// Validated proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KMS connector to activate: `"rest"`, `"sim"`, or `"perf"`.
    #[serde(default = "default_kms_connector_type")]
    pub kms_connector_type: String,

    /// KMS endpoint URL for the REST connector.
    /// **Required** unless running simulated or with the sim connector.
    #[serde(default)]
    pub kms_endpoint_url: String,

    /// Force the simulated connector regardless of `kms_connector_type`.
    #[serde(default)]
    pub simulated: bool,

    /// Default cipher key TTL applied when the KMS omits a refresh hint.
    #[serde(default = "default_cipher_key_cache_ttl")]
    pub encrypt_cipher_key_cache_ttl: i64,

    /// Period of the cipher key refresher sweep.
    #[serde(default = "default_key_refresh_interval")]
    pub encrypt_key_refresh_interval: i64,

    /// Local TTL bounding cached blob metadata.
    #[serde(default = "default_blob_metadata_cache_ttl")]
    pub blob_metadata_cache_ttl: i64,

    /// Period of the blob metadata refresher sweep.
    #[serde(default = "default_blob_metadata_refresh_interval")]
    pub blob_metadata_refresh_interval: i64,

    /// Re-attempt budget of the KMS backoff wrapper.
    #[serde(default = "default_kms_connection_retries")]
    pub ekp_kms_connection_retries: i64,

    /// Allow `http` KMS endpoints. Off by default; secure-only otherwise.
    #[serde(default)]
    pub rest_kms_enable_not_secure_connection: bool,

    /// Maximum pooled connections per `(host, service)` pair.
    #[serde(default = "default_connectionpool_size")]
    pub restclient_max_connectionpool_size: i64,

    /// Connection establishment attempts.
    #[serde(default = "default_connect_tries")]
    pub restclient_connect_tries: i64,

    /// Connection establishment timeout, seconds.
    #[serde(default = "default_connect_timeout")]
    pub restclient_connect_timeout: i64,

    /// Maximum pooled connection lifetime, seconds.
    #[serde(default = "default_max_connection_life")]
    pub restclient_max_connection_life: i64,

    /// Request attempts per KMS exchange.
    #[serde(default = "default_request_tries")]
    pub restclient_request_tries: i64,

    /// Per-request timeout, seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub restclient_request_timeout_secs: i64,

    /// REST client knob overrides, `name=value` pairs separated by commas.
    /// Long names and short aliases are both accepted.
    #[serde(default)]
    pub restclient_knob_overrides: String,

    /// Upper bound on the rendered length of per-request debug trace events.
    #[serde(default = "default_max_dbg_trace_length")]
    pub encrypt_proxy_max_dbg_trace_length: usize,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_kms_connector_type() -> String {
    KMS_CONNECTOR_TYPE_REST.into()
}
fn default_cipher_key_cache_ttl() -> i64 {
    600
}
fn default_key_refresh_interval() -> i64 {
    480
}
fn default_blob_metadata_cache_ttl() -> i64 {
    24 * 60 * 60
}
fn default_blob_metadata_refresh_interval() -> i64 {
    3600
}
fn default_kms_connection_retries() -> i64 {
    10
}
fn default_connectionpool_size() -> i64 {
    10
}
fn default_connect_tries() -> i64 {
    10
}
fn default_connect_timeout() -> i64 {
    10
}
fn default_max_connection_life() -> i64 {
    120
}
fn default_request_tries() -> i64 {
    10
}
fn default_request_timeout_secs() -> i64 {
    60
}
fn default_max_dbg_trace_length() -> usize {
    100_000
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or validation fails.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.encrypt_cipher_key_cache_ttl <= 0 {
            anyhow::bail!("ENCRYPT_CIPHER_KEY_CACHE_TTL must be > 0");
        }
        if self.encrypt_key_refresh_interval <= 0 {
            anyhow::bail!("ENCRYPT_KEY_REFRESH_INTERVAL must be > 0");
        }
        if self.blob_metadata_cache_ttl <= 0 {
            anyhow::bail!("BLOB_METADATA_CACHE_TTL must be > 0");
        }
        if self.blob_metadata_refresh_interval <= 0 {
            anyhow::bail!("BLOB_METADATA_REFRESH_INTERVAL must be > 0");
        }
        if self.ekp_kms_connection_retries < 0 {
            anyhow::bail!("EKP_KMS_CONNECTION_RETRIES must be >= 0");
        }
        if self.restclient_max_connectionpool_size <= 0 {
            anyhow::bail!("RESTCLIENT_MAX_CONNECTIONPOOL_SIZE must be > 0");
        }
        if !self.simulated
            && self.kms_connector_type == KMS_CONNECTOR_TYPE_REST
            && self.kms_endpoint_url.trim().is_empty()
        {
            anyhow::bail!("KMS_ENDPOINT_URL is required for the REST connector");
        }
        Ok(())
    }

    /// A configuration with all defaults and the sim connector, for tests.
    #[cfg(test)]
    pub fn default_for_tests() -> Self {
        Self {
            kms_connector_type: crate::kms::KMS_CONNECTOR_TYPE_SIM.into(),
            kms_endpoint_url: String::new(),
            simulated: false,
            encrypt_cipher_key_cache_ttl: default_cipher_key_cache_ttl(),
            encrypt_key_refresh_interval: default_key_refresh_interval(),
            blob_metadata_cache_ttl: default_blob_metadata_cache_ttl(),
            blob_metadata_refresh_interval: default_blob_metadata_refresh_interval(),
            ekp_kms_connection_retries: default_kms_connection_retries(),
            rest_kms_enable_not_secure_connection: false,
            restclient_max_connectionpool_size: default_connectionpool_size(),
            restclient_connect_tries: default_connect_tries(),
            restclient_connect_timeout: default_connect_timeout(),
            restclient_max_connection_life: default_max_connection_life(),
            restclient_request_tries: default_request_tries(),
            restclient_request_timeout_secs: default_request_timeout_secs(),
            restclient_knob_overrides: String::new(),
            encrypt_proxy_max_dbg_trace_length: default_max_dbg_trace_length(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_kms_connector_type(), "rest");
        assert_eq!(default_cipher_key_cache_ttl(), 600);
        assert_eq!(default_key_refresh_interval(), 480);
        assert_eq!(default_blob_metadata_cache_ttl(), 86_400);
        assert_eq!(default_blob_metadata_refresh_interval(), 3600);
        assert_eq!(default_kms_connection_retries(), 10);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_accepts_defaults() {
        Config::default_for_tests().validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_refresh_interval() {
        let mut cfg = Config::default_for_tests();
        cfg.encrypt_key_refresh_interval = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rest_connector_requires_endpoint() {
        let mut cfg = Config::default_for_tests();
        cfg.kms_connector_type = KMS_CONNECTOR_TYPE_REST.into();
        cfg.kms_endpoint_url = String::new();
        assert!(cfg.validate().is_err());

        cfg.kms_endpoint_url = "https://kms.example.com/v1".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn simulated_does_not_require_endpoint() {
        let mut cfg = Config::default_for_tests();
        cfg.kms_connector_type = KMS_CONNECTOR_TYPE_REST.into();
        cfg.simulated = true;
        cfg.validate().unwrap();
    }
}

//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `QUEUECTL_CONFIG`
//! environment variable. A missing file is not an error: every field has a default.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `QUEUECTL_` override YAML values
//! 3. **LM_STUDIO_URL** - Special case: overrides `backend.url` if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `QUEUECTL_BACKEND__STALL_TIMEOUT=30s` sets the `backend.stall_timeout` field.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! QUEUECTL_PORT=8001
//!
//! # Point at the model server
//! LM_STUDIO_URL="http://10.0.0.5:1234"
//!
//! # Tighten the generation ceiling
//! QUEUECTL_BACKEND__REQUEST_TIMEOUT=2m
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "QUEUECTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// This is the root configuration structure loaded from YAML and environment variables.
/// All fields have sensible defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// The single downstream generation server
    pub backend: BackendConfig,
    /// Admission queue and streaming behaviour
    pub queue: QueueConfig,
    /// Sampling parameters applied when a payload leaves them unset
    pub defaults: SamplingDefaults,
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// Connection settings for the downstream OpenAI-compatible model server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL of the model server, without the `/v1` suffix
    pub url: Url,
    /// Sent as `Authorization: Bearer` when non-empty
    pub api_key: String,
    /// Maximum time to establish a TCP connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maximum silence between streamed chunks (or before a non-streaming body arrives)
    #[serde(with = "humantime_serde")]
    pub stall_timeout: Duration,
    /// Hard ceiling on a single generation, however steadily it streams
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:1234".parse().expect("default backend url is valid"),
            api_key: "lm_studio".to_string(),
            connect_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// How long a non-streaming chat completion call waits for its record to finish.
    /// The record itself keeps running after the caller gives up.
    #[serde(with = "humantime_serde")]
    pub completion_wait_timeout: Duration,
    /// Interval for SSE keep-alive comments on long waits. `None` disables them.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            completion_wait_timeout: Duration::from_secs(300),
            keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

/// Defaults forwarded to the backend when the caller does not set them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingDefaults {
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests. Empty disables the CORS layer entirely.
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// An allowed CORS origin.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            backend: BackendConfig::default(),
            queue: QueueConfig::default(),
            defaults: SamplingDefaults::default(),
            cors: CorsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if !matches!(self.backend.url.scheme(), "http" | "https") {
            return Err(Error::BadRequest {
                message: format!(
                    "Config validation: backend.url must be an http(s) URL, got scheme '{}'",
                    self.backend.url.scheme()
                ),
            });
        }

        for (name, value) in [
            ("backend.connect_timeout", self.backend.connect_timeout),
            ("backend.stall_timeout", self.backend.stall_timeout),
            ("backend.request_timeout", self.backend.request_timeout),
            ("queue.completion_wait_timeout", self.queue.completion_wait_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::BadRequest {
                    message: format!("Config validation: {name} must be greater than zero"),
                });
            }
        }

        if self.backend.stall_timeout > self.backend.request_timeout {
            return Err(Error::BadRequest {
                message: format!(
                    "Config validation: backend.stall_timeout ({}) exceeds backend.request_timeout ({})",
                    humantime::format_duration(self.backend.stall_timeout),
                    humantime::format_duration(self.backend.request_timeout),
                ),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("QUEUECTL_").split("__"))
            // The model server location has always been configurable on its own
            .merge(Env::raw().only(&["LM_STUDIO_URL"]).map(|_| "backend.url".into()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml"))?;

            assert_eq!(config.port, 8000);
            assert_eq!(config.backend.url.as_str(), "http://localhost:1234/");
            assert_eq!(config.backend.api_key, "lm_studio");
            assert_eq!(config.queue.completion_wait_timeout, Duration::from_secs(300));
            assert_eq!(config.defaults.temperature, 0.7);
            assert!(config.cors.allowed_origins.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_durations() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
backend:
  url: http://gpu-box:1234
  stall_timeout: 30s
  request_timeout: 5m
queue:
  completion_wait_timeout: 90s
  keep_alive: null
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.backend.url.host_str(), Some("gpu-box"));
            assert_eq!(config.backend.stall_timeout, Duration::from_secs(30));
            assert_eq!(config.backend.request_timeout, Duration::from_secs(300));
            assert_eq!(config.queue.completion_wait_timeout, Duration::from_secs(90));
            assert_eq!(config.queue.keep_alive, None);
            // Untouched fields keep their defaults
            assert_eq!(config.backend.connect_timeout, Duration::from_secs(10));
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 9000
backend:
  url: http://from-yaml:1234
"#,
            )?;

            jail.set_env("QUEUECTL_PORT", "8001");
            jail.set_env("QUEUECTL_BACKEND__STALL_TIMEOUT", "45s");
            jail.set_env("LM_STUDIO_URL", "http://from-env:4321");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.port, 8001);
            assert_eq!(config.backend.stall_timeout, Duration::from_secs(45));
            assert_eq!(config.backend.url.host_str(), Some("from-env"));
            assert_eq!(config.backend.url.port(), Some(4321));
            Ok(())
        });
    }

    #[test]
    fn test_cors_origins() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
cors:
  allowed_origins:
    - "*"
    - https://playground.example.com
  max_age: 600
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.cors.allowed_origins.len(), 2);
            assert!(matches!(config.cors.allowed_origins[0], CorsOrigin::Wildcard));
            match &config.cors.allowed_origins[1] {
                CorsOrigin::Url(url) => assert_eq!(url.host_str(), Some("playground.example.com")),
                other => panic!("expected url origin, got {other:?}"),
            }
            assert_eq!(config.cors.max_age, Some(600));
            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "backend:\n  urll: http://typo:1234\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_inverted_timeouts() {
        let mut config = Config::default();
        config.backend.stall_timeout = Duration::from_secs(900);
        config.backend.request_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = Config::default();
        config.backend.connect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_non_http_backend() {
        let mut config = Config::default();
        config.backend.url = "ftp://models.example.com".parse().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_address() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8001,
            ..Default::default()
        };
        assert_eq!(config.bind_address(), "127.0.0.1:8001");
    }
}

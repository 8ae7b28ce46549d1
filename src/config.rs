//! Agent settings.
//!
//! Defaults suit a device talking to the platform over a reasonable link.
//! Settings can be read from TOML or from `LIBIOT_AGENT_*` environment
//! variables (a `.env` file in the working directory is honoured).
//!
//! ```toml
//! request_timeout_secs = 30
//! assertion_lifetime_secs = 300
//! grant = "jwt_bearer"
//! storage_dir = "/var/lib/agent"
//!
//! [retry]
//! max_attempts = 5
//! base_delay = 300
//! max_delay = 10000
//!
//! [upload]
//! chunk_size = 8388608
//! parallel_uploads = 3
//! ```

#![allow(missing_docs)]

use crate::network::retry::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Longest lifetime accepted for a client assertion.
pub const MAX_ASSERTION_LIFETIME_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid settings file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: String, value: String },
}

/// How the token request presents the client assertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStyle {
    /// `grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer` with `assertion=<jwt>`.
    #[default]
    JwtBearer,
    /// `grant_type=client_credentials` with `client_assertion_type` and `client_assertion`.
    ClientCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Bytes per chunk, and the size limit for unchunked uploads.
    pub chunk_size: usize,
    pub parallel_uploads: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            parallel_uploads: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub assertion_lifetime_secs: u64,
    /// A cached token is replaced this many seconds before it expires.
    pub token_refresh_margin_secs: u64,
    /// `renew_token` rotates the client secret when it expires within this window.
    pub secret_rotation_margin_secs: u64,
    pub grant: GrantStyle,
    /// Overrides the tenant key set URL derived from the boarding content.
    pub jwks_url: Option<String>,
    /// How many superseded registrations are kept for manual recovery.
    pub recovery_depth: usize,
    pub upload: UploadSettings,
    pub proxy: Option<String>,
    pub storage_dir: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
            assertion_lifetime_secs: 300,
            token_refresh_margin_secs: 60,
            secret_rotation_margin_secs: 24 * 60 * 60,
            grant: GrantStyle::JwtBearer,
            jwks_url: None,
            recovery_depth: 5,
            upload: UploadSettings::default(),
            proxy: None,
            storage_dir: PathBuf::from(".libiot-agent"),
        }
    }
}

impl AgentSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults overridden by `LIBIOT_AGENT_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        for (name, value) in vars {
            let Some(key) = name.strip_prefix("LIBIOT_AGENT_") else {
                continue;
            };
            match key {
                "REQUEST_TIMEOUT_SECS" => settings.request_timeout_secs = parse(&name, &value)?,
                "RETRY_MAX_ATTEMPTS" => settings.retry.max_attempts = parse(&name, &value)?,
                "RETRY_BASE_DELAY_MS" => {
                    settings.retry.base_delay = Duration::from_millis(parse(&name, &value)?)
                }
                "RETRY_MAX_DELAY_MS" => {
                    settings.retry.max_delay = Duration::from_millis(parse(&name, &value)?)
                }
                "ASSERTION_LIFETIME_SECS" => {
                    settings.assertion_lifetime_secs = parse(&name, &value)?
                }
                "TOKEN_REFRESH_MARGIN_SECS" => {
                    settings.token_refresh_margin_secs = parse(&name, &value)?
                }
                "SECRET_ROTATION_MARGIN_SECS" => {
                    settings.secret_rotation_margin_secs = parse(&name, &value)?
                }
                "GRANT" => {
                    settings.grant = match value.as_str() {
                        "jwt_bearer" => GrantStyle::JwtBearer,
                        "client_credentials" => GrantStyle::ClientCredentials,
                        _ => {
                            return Err(ConfigError::InvalidVar {
                                name: name.clone(),
                                value,
                            });
                        }
                    }
                }
                "JWKS_URL" => settings.jwks_url = Some(value),
                "RECOVERY_DEPTH" => settings.recovery_depth = parse(&name, &value)?,
                "UPLOAD_CHUNK_SIZE" => settings.upload.chunk_size = parse(&name, &value)?,
                "UPLOAD_PARALLEL" => settings.upload.parallel_uploads = parse(&name, &value)?,
                "PROXY" => settings.proxy = Some(value),
                "STORAGE_DIR" => settings.storage_dir = PathBuf::from(value),
                _ => tracing::debug!(%name, "ignoring unknown agent setting"),
            }
        }
        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Assertion lifetime, clamped to `1..=MAX_ASSERTION_LIFETIME_SECS`.
    pub fn assertion_lifetime(&self) -> u64 {
        self.assertion_lifetime_secs
            .clamp(1, MAX_ASSERTION_LIFETIME_SECS)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let settings = AgentSettings::from_toml_str(
            r#"
            assertion_lifetime_secs = 120
            grant = "client_credentials"

            [retry]
            max_attempts = 7
            base_delay = 50

            [upload]
            parallel_uploads = 8
            "#,
        )
        .unwrap();
        assert_eq!(settings.assertion_lifetime(), 120);
        assert_eq!(settings.grant, GrantStyle::ClientCredentials);
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(50));
        assert_eq!(settings.retry.max_delay, RetryPolicy::default().max_delay);
        assert_eq!(settings.upload.parallel_uploads, 8);
        assert_eq!(settings.upload.chunk_size, UploadSettings::default().chunk_size);
    }

    #[test]
    fn env_vars_override_defaults() {
        let settings = AgentSettings::from_vars([
            ("LIBIOT_AGENT_RETRY_MAX_ATTEMPTS".to_string(), "2".to_string()),
            ("LIBIOT_AGENT_JWKS_URL".to_string(), "https://keys.example".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ])
        .unwrap();
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.jwks_url.as_deref(), Some("https://keys.example"));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = AgentSettings::from_vars([(
            "LIBIOT_AGENT_UPLOAD_PARALLEL".to_string(),
            "many".to_string(),
        )])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { .. }));
    }

    #[test]
    fn assertion_lifetime_is_capped() {
        let settings = AgentSettings {
            assertion_lifetime_secs: 3600,
            ..AgentSettings::default()
        };
        assert_eq!(settings.assertion_lifetime(), MAX_ASSERTION_LIFETIME_SECS);
    }
}

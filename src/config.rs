//! Client configuration

use crate::error::{ClientError, Result};
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8008";
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh";

/// Configuration for the proactive renewal scheduler
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Refresh this long before the stored expiry
    /// Default: 5 minutes
    pub lead_time: Duration,

    /// Route timer-driven refreshes through the same single-flight gate as
    /// request-driven ones. With `false` the timer calls the refresher directly
    /// and the two paths may overlap; the last persisted pair wins.
    /// Default: true
    pub share_refresh_gate: bool,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_secs(5 * 60),
            share_refresh_gate: true,
        }
    }
}

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API origin, e.g. `http://localhost:8008`
    pub base_url: String,

    /// Path of the token refresh endpoint, joined to `base_url`
    pub refresh_path: String,

    /// Per-request timeout
    /// Default: 30 seconds
    pub request_timeout: Duration,

    pub renewal: RenewalConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout: Duration::from_secs(30),
            renewal: RenewalConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Build a config from `SHAREHUB_*` environment variables, falling back to defaults
    ///
    /// - `SHAREHUB_API_URL`
    /// - `SHAREHUB_REFRESH_LEAD_SECS`
    /// - `SHAREHUB_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("SHAREHUB_API_URL") {
            config.base_url = url;
        }
        if let Some(secs) = lookup("SHAREHUB_REFRESH_LEAD_SECS") {
            config.renewal.lead_time = Duration::from_secs(parse_secs("SHAREHUB_REFRESH_LEAD_SECS", &secs)?);
        }
        if let Some(secs) = lookup("SHAREHUB_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_secs("SHAREHUB_REQUEST_TIMEOUT_SECS", &secs)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::Configuration(format!("Invalid base URL {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Configuration(format!(
                "Unsupported base URL scheme: {}",
                url.scheme()
            )));
        }
        if !self.refresh_path.starts_with('/') {
            return Err(ClientError::Configuration(format!(
                "Refresh path must start with '/': {}",
                self.refresh_path
            )));
        }
        Ok(())
    }

    /// Resolve a resource (absolute URL or path) against `base_url`
    pub fn resolve(&self, resource: &str) -> Result<Url> {
        let raw = if resource.starts_with("http://") || resource.starts_with("https://") {
            resource.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                resource.trim_start_matches('/')
            )
        };

        Url::parse(&raw).map_err(|e| ClientError::Configuration(format!("Invalid URL {raw:?}: {e}")))
    }

    pub fn refresh_url(&self) -> Result<Url> {
        self.resolve(&self.refresh_path)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| ClientError::Configuration(format!("{key} must be a number of seconds: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.renewal.lead_time, Duration::from_secs(300));
        assert!(config.renewal.share_refresh_gate);
        assert_eq!(config.refresh_url().unwrap().as_str(), "http://localhost:8008/api/auth/refresh");
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SHAREHUB_API_URL", "https://api.example.com/"),
            ("SHAREHUB_REFRESH_LEAD_SECS", "120"),
            ("SHAREHUB_REQUEST_TIMEOUT_SECS", " 5 "),
        ]))
        .unwrap();

        assert_eq!(config.renewal.lead_time, Duration::from_secs(120));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.resolve("/api/auth/me").unwrap().as_str(),
            "https://api.example.com/api/auth/me"
        );
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("SHAREHUB_REFRESH_LEAD_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));

        let err = ClientConfig::from_lookup(lookup(&[("SHAREHUB_API_URL", "ftp://host")])).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[test]
    fn test_absolute_resource_kept() {
        let config = ClientConfig::default();
        assert_eq!(
            config.resolve("http://other:9000/v1/x").unwrap().as_str(),
            "http://other:9000/v1/x"
        );
    }
}

//! Provider configuration

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use metal_common::{Error, Result, WaitSpec};

/// Environment variable holding the API auth token
pub const AUTH_TOKEN_ENV: &str = "METAL_AUTH_TOKEN";

/// Environment variable overriding the API endpoint
pub const ENDPOINT_ENV: &str = "METAL_ENDPOINT";

/// Provider configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the metal API
    pub endpoint: String,

    /// The API auth token for API operations
    pub auth_token: String,

    /// Wait bounds for machine provisioning
    pub timeouts: TimeoutConfig,

    /// Condition that marks a machine as ready
    pub ready: ReadyCondition,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://metal.test.fi-ts.io".to_string(),
            auth_token: String::new(),
            timeouts: TimeoutConfig::default(),
            ready: ReadyCondition::default(),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &"<redacted>")
            .field("timeouts", &self.timeouts)
            .field("ready", &self.ready)
            .finish()
    }
}

/// Provisioning wait bounds, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for create including the readiness wait
    pub create_secs: u64,

    /// Grace period before the first readiness check
    pub delay_secs: u64,

    /// Minimum interval between readiness checks
    pub min_poll_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_secs: 60 * 60,
            delay_secs: 10,
            min_poll_interval_secs: 3,
        }
    }
}

/// Attribute and value that mark a machine as ready
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadyCondition {
    pub attribute: String,
    pub target: String,
}

impl Default for ReadyCondition {
    fn default() -> Self {
        Self {
            attribute: "state".to_string(),
            target: "Active".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from file, defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Override values from `METAL_AUTH_TOKEN` and `METAL_ENDPOINT`
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(token) = lookup(AUTH_TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.auth_token = token;
        }
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|e| !e.is_empty()) {
            self.endpoint = endpoint;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_token.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "auth_token is required (set it in the config file or {})",
                AUTH_TOKEN_ENV
            )));
        }
        self.endpoint_url()?;

        let t = &self.timeouts;
        if t.create_secs == 0 {
            return Err(Error::InvalidConfig("timeouts.create_secs must be positive".to_string()));
        }
        if t.min_poll_interval_secs > t.create_secs {
            return Err(Error::InvalidConfig(
                "timeouts.min_poll_interval_secs must not exceed timeouts.create_secs".to_string(),
            ));
        }
        if self.ready.attribute.is_empty() || self.ready.target.is_empty() {
            return Err(Error::InvalidConfig("ready.attribute and ready.target are required".to_string()));
        }
        Ok(())
    }

    /// Parsed endpoint, always ending in a slash so paths join below it
    pub fn endpoint_url(&self) -> Result<Url> {
        let raw = if self.endpoint.ends_with('/') {
            self.endpoint.clone()
        } else {
            format!("{}/", self.endpoint)
        };
        let url = Url::parse(&raw)
            .map_err(|e| Error::InvalidConfig(format!("invalid endpoint {}: {}", self.endpoint, e)))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::InvalidConfig(format!(
                "endpoint scheme must be http or https, got {}",
                other
            ))),
        }
    }

    /// Readiness condition awaited after a create
    pub fn ready_wait(&self) -> WaitSpec {
        WaitSpec::new(
            &self.ready.attribute,
            &self.ready.target,
            Duration::from_secs(self.timeouts.create_secs),
        )
        .with_delay(Duration::from_secs(self.timeouts.delay_secs))
        .with_min_timeout(Duration::from_secs(self.timeouts.min_poll_interval_secs))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("cannot encode config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

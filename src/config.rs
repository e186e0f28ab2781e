// Client configuration
//
// Built once at startup and passed by reference; nothing in the library reads
// the process environment except `Credentials::from_env`.

use crate::error::ClientError;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://test.api.amadeus.com/v1/";
pub const API_KEY_VAR: &str = "API_KEY";
pub const API_SECRET_VAR: &str = "API_SECRET";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    // Reads API_KEY / API_SECRET. Either one missing or empty is fatal.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ClientError::ConfigError(format!("missing credential: {}", name)))
        };

        Ok(Self {
            client_id: read(API_KEY_VAR)?,
            client_secret: read(API_SECRET_VAR)?,
        })
    }
}

// Keep the secret out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token_timeout: Duration,
    // None leaves resource calls unbounded
    pub request_timeout: Option<Duration>,
    pub cache_tokens: bool,
    pub token_refresh_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            cache_tokens: false,
            token_refresh_margin: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token_cache(mut self, enabled: bool) -> Self {
        self.cache_tokens = enabled;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FanOutConfig {
    // None means one in-flight unit per origin with no ceiling
    pub max_concurrency: Option<usize>,
}

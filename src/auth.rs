// OAuth2 client-credentials authentication

use crate::client::endpoint_url;
use crate::config::{ClientConfig, Credentials};
use crate::error::{ApiError, ClientError};
use crate::models::AccessToken;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

const TOKEN_PATH: [&str; 3] = ["security", "oauth2", "token"];

// Anything that can hand out a bearer token. Failures are always returned,
// never fatal, so concurrent callers fail independently.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn acquire_token(&self) -> Result<AccessToken, ApiError>;

    // Identity the token belongs to; used to key cached tokens
    fn cache_key(&self) -> &str;
}

#[async_trait]
impl<T: Authenticator + ?Sized> Authenticator for Box<T> {
    async fn acquire_token(&self) -> Result<AccessToken, ApiError> {
        (**self).acquire_token().await
    }

    fn cache_key(&self) -> &str {
        (**self).cache_key()
    }
}

// Performs a fresh token exchange on every call
pub struct OAuthAuthenticator {
    credentials: Credentials,
    http: reqwest::Client,
    token_url: Url,
    timeout: Duration,
}

impl OAuthAuthenticator {
    pub fn new(
        credentials: Credentials,
        http: reqwest::Client,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let token_url = endpoint_url(&config.base_url, &TOKEN_PATH)
            .map_err(|e| ClientError::ConfigError(e.to_string()))?;

        Ok(Self {
            credentials,
            http,
            token_url,
            timeout: config.token_timeout,
        })
    }

    pub fn from_config(credentials: Credentials, config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::InitError(e.to_string()))?;
        Self::new(credentials, http, config)
    }

    fn check_credentials(&self) -> Result<(), ApiError> {
        if self.credentials.client_id.is_empty() {
            return Err(ApiError::Config("missing credential: client_id".to_string()));
        }
        if self.credentials.client_secret.is_empty() {
            return Err(ApiError::Config("missing credential: client_secret".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for OAuthAuthenticator {
    async fn acquire_token(&self) -> Result<AccessToken, ApiError> {
        self.check_credentials()?;

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];

        tracing::debug!(url = %self.token_url, "requesting access token");

        let response = self
            .http
            .post(self.token_url.clone())
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!("could not read token error body: {}", e);
                    String::new()
                }
            };
            return Err(ApiError::Auth(format!(
                "unexpected status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body = response.bytes().await?;
        let token: AccessToken = serde_json::from_slice(&body)?;

        tracing::debug!(expires_in = token.expires_in, "access token acquired");
        Ok(token)
    }

    fn cache_key(&self) -> &str {
        &self.credentials.client_id
    }
}

// Booking API client
//
// One pooled reqwest client is shared by every call. Each resource call
// authenticates first; the bearer token is only ever attached after a
// successful exchange.

use crate::auth::{Authenticator, OAuthAuthenticator};
use crate::config::{ClientConfig, Credentials};
use crate::error::{ApiError, ClientError};
use crate::models::{CancellationResponse, FetchOutcome, FetchRequest, FlightResponse, RawResponse};
use crate::token_cache::CachedAuthenticator;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

const SEARCH_PATH: [&str; 2] = ["shopping", "flight-destinations"];

// Joins path segments onto the base URL, percent-encoding each segment
pub fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url =
        Url::parse(base).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| ApiError::InvalidUrl(format!("{}: cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// The single-fetch seam the fan-out orchestrator drives
#[async_trait]
pub trait FlightSearcher: Send + Sync + 'static {
    // Never fails past this boundary; every error lands in the Failure variant
    async fn fetch_one(&self, request: FetchRequest) -> FetchOutcome;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub auth_failures: usize,
}

pub struct AmadeusClient<A = Box<dyn Authenticator>> {
    http: reqwest::Client,
    auth: A,
    base_url: String,
    request_timeout: Option<Duration>,
    stats: Mutex<ClientStats>,
}

impl AmadeusClient {
    // Builds the OAuth authenticator over the shared connection pool, wrapped
    // in the token cache when the config asks for it
    pub fn new(credentials: Credentials, config: &ClientConfig) -> Result<Self, ClientError> {
        let http = build_http_client()?;
        let oauth = OAuthAuthenticator::new(credentials, http.clone(), config)?;

        let auth: Box<dyn Authenticator> = if config.cache_tokens {
            Box::new(CachedAuthenticator::new(oauth, config.token_refresh_margin))
        } else {
            Box::new(oauth)
        };

        Self::from_parts(http, auth, config)
    }
}

impl<A: Authenticator> AmadeusClient<A> {
    pub fn with_authenticator(auth: A, config: &ClientConfig) -> Result<Self, ClientError> {
        Self::from_parts(build_http_client()?, auth, config)
    }

    fn from_parts(http: reqwest::Client, auth: A, config: &ClientConfig) -> Result<Self, ClientError> {
        // Reject an unusable base URL up front rather than on every call
        endpoint_url(&config.base_url, &[]).map_err(|e| ClientError::ConfigError(e.to_string()))?;

        Ok(Self {
            http,
            auth,
            base_url: config.base_url.clone(),
            request_timeout: config.request_timeout,
            stats: Mutex::new(ClientStats::default()),
        })
    }

    pub fn authenticator(&self) -> &A {
        &self.auth
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }

    // GET /shopping/flight-destinations?origin=..&maxPrice=..
    pub async fn search_flight_destinations(
        &self,
        origin: &str,
        max_price: &str,
    ) -> Result<FlightResponse, ApiError> {
        let url = endpoint_url(&self.base_url, &SEARCH_PATH)?;
        let request = self
            .http
            .get(url)
            .query(&[("origin", origin), ("maxPrice", max_price)]);

        let response = self.send_authorized(request).await?;
        decode_success(response).await
    }

    // POST /ordering/transfer-orders/{order_id}/transfers/cancellation?confirmNbr=..
    pub async fn cancel_transfer(
        &self,
        order_id: &str,
        confirm_nbr: &str,
    ) -> Result<CancellationResponse, ApiError> {
        let url = endpoint_url(
            &self.base_url,
            &["ordering", "transfer-orders", order_id, "transfers", "cancellation"],
        )?;
        let request = self.http.post(url).query(&[("confirmNbr", confirm_nbr)]);

        let response = self.send_authorized(request).await?;
        decode_success(response).await
    }

    // DELETE /booking/flight-orders/{flight_order_id}
    // The body is handed back verbatim whatever the status.
    pub async fn delete_flight_order(&self, flight_order_id: &str) -> Result<RawResponse, ApiError> {
        let url = endpoint_url(&self.base_url, &["booking", "flight-orders", flight_order_id])?;
        let request = self.http.delete(url);

        let response = self.send_authorized(request).await?;
        let status = response.status();
        let body = response.bytes().await?;

        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status.to_string(),
            body,
        })
    }

    async fn send_authorized(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let token = match self.auth.acquire_token().await {
            Ok(token) => token,
            Err(e) => {
                self.stats.lock().auth_failures += 1;
                return Err(e);
            }
        };

        let mut request = request.bearer_auth(&token.access_token);
        if let Some(timeout) = self.request_timeout {
            request = request.timeout(timeout);
        }

        self.stats.lock().requests_sent += 1;
        let result = request.send().await;

        let mut stats = self.stats.lock();
        match &result {
            Ok(response) if response.status().is_success() => stats.requests_succeeded += 1,
            _ => stats.requests_failed += 1,
        }
        drop(stats);

        Ok(result?)
    }
}

#[async_trait]
impl<A: Authenticator> FlightSearcher for AmadeusClient<A> {
    async fn fetch_one(&self, request: FetchRequest) -> FetchOutcome {
        tracing::debug!(origin = %request.origin, max_price = %request.max_price, "fetching destinations");

        let result = self
            .search_flight_destinations(&request.origin, &request.max_price)
            .await;

        if let Err(e) = &result {
            tracing::warn!(origin = %request.origin, error = %e, "destination search failed");
        }

        FetchOutcome::from_result(request.origin, result)
    }
}

fn build_http_client() -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| ClientError::InitError(e.to_string()))
}

// Non-2xx responses are reported with their status line and never decoded
async fn decode_success<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            status: status.as_u16(),
            message: status.to_string(),
        });
    }

    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

// Client for the Amadeus self-service travel API with concurrent multi-origin search

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod fan_out;
pub mod logging;
pub mod models;
pub mod token_cache;

// Re-export key types for convenience
pub use auth::{Authenticator, OAuthAuthenticator};
pub use client::{AmadeusClient, ClientStats, FlightSearcher};
pub use config::{ClientConfig, Credentials, FanOutConfig};
pub use error::{ApiError, ClientError, ErrorKind};
pub use fan_out::{fetch_all, CancelHandle, FanOut, FanOutState};
pub use models::{
    AccessToken, CancellationResponse, FetchOutcome, FetchRequest, FlightDestination,
    FlightResponse, RawResponse,
};
pub use token_cache::{CachedAuthenticator, TokenCacheStatsReport};

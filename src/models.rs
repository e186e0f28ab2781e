use crate::error::ApiError;
use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// Token endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
}

// Flight destination search response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlightResponse {
    pub data: Vec<FlightDestination>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightDestination {
    #[serde(rename = "type")]
    pub flight_type: String,
    pub origin: String,
    pub destination: String,
    pub departure_date: String,
    pub return_date: String,
    pub price: FlightPrice,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlightPrice {
    pub total: String,
}

impl FlightDestination {
    pub fn departure_day(&self) -> Result<NaiveDate, chrono::ParseError> {
        NaiveDate::parse_from_str(&self.departure_date, "%Y-%m-%d")
    }

    pub fn return_day(&self) -> Result<NaiveDate, chrono::ParseError> {
        NaiveDate::parse_from_str(&self.return_date, "%Y-%m-%d")
    }

    pub fn price_total(&self) -> Option<f64> {
        self.price.total.parse().ok()
    }
}

// Transfer cancellation response
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CancellationResponse {
    pub data: CancellationData,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationData {
    pub confirm_nbr: String,
    pub reservation_status: String,
}

// Undecoded response, used where the body is only echoed back to the user
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Bytes,
}

impl RawResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// One unit of fan-out work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub origin: String,
    pub max_price: String,
}

impl FetchRequest {
    pub fn new(origin: impl Into<String>, max_price: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            max_price: max_price.into(),
        }
    }
}

// Exactly one of these is produced per FetchRequest
#[derive(Debug)]
pub enum FetchOutcome {
    Success {
        origin: String,
        response: FlightResponse,
    },
    Failure {
        origin: String,
        error: ApiError,
    },
}

impl FetchOutcome {
    pub fn from_result(origin: String, result: Result<FlightResponse, ApiError>) -> Self {
        match result {
            Ok(response) => FetchOutcome::Success { origin, response },
            Err(error) => FetchOutcome::Failure { origin, error },
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            FetchOutcome::Success { origin, .. } | FetchOutcome::Failure { origin, .. } => origin,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn into_result(self) -> Result<FlightResponse, ApiError> {
        match self {
            FetchOutcome::Success { response, .. } => Ok(response),
            FetchOutcome::Failure { error, .. } => Err(error),
        }
    }
}

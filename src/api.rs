// External collaborators: the capped search endpoint, the batch detail endpoint
// and the rate-limited routing endpoint. Only their boundary lives here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    geo::Coordinate,
    listing::{Listing, ListingId, ListingLocation},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("API error: {status_code} - {message}")]
    ApiResponseError { status_code: u16, message: String },

    #[error("Rate limited, server asked to wait {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Quota exceeded after {attempts} attempts (last wait hint {retry_after:?})")]
    QuotaExceeded { attempts: u32, retry_after: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    DecodeError(String),
}

impl ApiError {
    /// Connection failures, timeouts and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::NetworkError(_) | ApiError::Timeout(_) => true,
            ApiError::ApiResponseError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub listings: Vec<ListingLocation>,
    // May exceed `listings.len()` when the endpoint caps its results
    pub total_count: usize,
}

#[async_trait]
pub trait SearchApi: Send + Sync + 'static {
    async fn search(&self, polygon: &[Coordinate]) -> Result<SearchPage, ApiError>;
}

#[async_trait]
pub trait DetailApi: Send + Sync + 'static {
    async fn fetch_details(&self, ids: &[ListingId]) -> Result<Vec<Listing>, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Bus,
    Coach,
    Cycle,
    Dlr,
    ElizabethLine,
    NationalRail,
    Overground,
    RiverBus,
    Tram,
    Tube,
    Walking,
    #[serde(other)]
    Other,
}

impl Mode {
    pub fn id(&self) -> &'static str {
        match self {
            Mode::Bus => "bus",
            Mode::Coach => "coach",
            Mode::Cycle => "cycle",
            Mode::Dlr => "dlr",
            Mode::ElizabethLine => "elizabeth-line",
            Mode::NationalRail => "national-rail",
            Mode::Overground => "overground",
            Mode::RiverBus => "river-bus",
            Mode::Tram => "tram",
            Mode::Tube => "tube",
            Mode::Walking => "walking",
            Mode::Other => "other",
        }
    }

    pub fn from_id(id: &str) -> Self {
        match id {
            "bus" => Mode::Bus,
            "coach" => Mode::Coach,
            "cycle" => Mode::Cycle,
            "dlr" => Mode::Dlr,
            "elizabeth-line" => Mode::ElizabethLine,
            "national-rail" => Mode::NationalRail,
            "overground" => Mode::Overground,
            "river-bus" => Mode::RiverBus,
            "tram" => Mode::Tram,
            "tube" => Mode::Tube,
            "walking" => Mode::Walking,
            _ => Mode::Other,
        }
    }

    pub fn default_allowed() -> Vec<Mode> {
        vec![
            Mode::Tube,
            Mode::Overground,
            Mode::Dlr,
            Mode::ElizabethLine,
            Mode::Walking,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub duration: Duration,
    pub departure: DateTime<Utc>,
    pub arrival: DateTime<Utc>,
    pub mode: Mode,
    pub route: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JourneyQuery {
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub arrival: DateTime<Utc>,
    pub modes: Vec<Mode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingResponse {
    Journeys(Vec<Journey>),
    // The location matched several candidate places
    Disambiguation,
}

#[async_trait]
pub trait RoutingApi: Send + Sync + 'static {
    async fn journey_results(&self, query: &JourneyQuery) -> Result<RoutingResponse, ApiError>;
}

/// The next Monday-Friday strictly after `now`, at `at` (UTC). All journey
/// queries of a run share this arrival time.
pub fn next_weekday_arrival(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let mut day = now.date_naive() + chrono::Duration::days(1);
    while day.weekday().number_from_monday() > 5 {
        day = day + chrono::Duration::days(1);
    }
    day.and_time(at).and_utc()
}

// Accept/reject decision for a single listing

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    api::{ApiError, Journey, RoutingResponse},
    geo::Coordinate,
    listing::{Listing, ListingError},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub location: Coordinate,
    pub max_commute: Duration,
}

impl Destination {
    pub fn new(name: impl Into<String>, location: Coordinate, max_commute: Duration) -> Self {
        Self {
            name: name.into(),
            location,
            max_commute,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    // Monthly-equivalent ceiling
    pub max_price: Option<f64>,
    pub max_age_days: Option<i64>,
    pub min_square_meters: Option<f64>,
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    Category,
    MissingPrice,
    TooSmall { square_meters: f64, minimum: f64 },
    Unavailable,
    TooExpensive { monthly: f64, maximum: f64 },
    TooOld { age_days: i64, maximum: i64 },
    NoJourney { destination: String },
    CommuteTooLong {
        destination: String,
        fastest: Duration,
        maximum: Duration,
    },
    LookupFailed { destination: String, error: ApiError },
}

impl RejectionReason {
    // Stable label for counters
    pub fn kind(&self) -> &'static str {
        match self {
            RejectionReason::Category => "category",
            RejectionReason::MissingPrice => "missing_price",
            RejectionReason::TooSmall { .. } => "too_small",
            RejectionReason::Unavailable => "unavailable",
            RejectionReason::TooExpensive { .. } => "too_expensive",
            RejectionReason::TooOld { .. } => "too_old",
            RejectionReason::NoJourney { .. } => "no_journey",
            RejectionReason::CommuteTooLong { .. } => "commute_too_long",
            RejectionReason::LookupFailed { .. } => "lookup_failed",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Category => write!(f, "excluded category"),
            RejectionReason::MissingPrice => write!(f, "no price"),
            RejectionReason::TooSmall {
                square_meters,
                minimum,
            } => write!(f, "{square_meters} m² is below {minimum} m²"),
            RejectionReason::Unavailable => write!(f, "already let or sold"),
            RejectionReason::TooExpensive { monthly, maximum } => {
                write!(f, "{monthly:.2} per month exceeds {maximum:.2}")
            }
            RejectionReason::TooOld { age_days, maximum } => {
                write!(f, "listed {age_days} days ago, limit {maximum}")
            }
            RejectionReason::NoJourney { destination } => {
                write!(f, "no journey to {destination}")
            }
            RejectionReason::CommuteTooLong {
                destination,
                fastest,
                maximum,
            } => write!(
                f,
                "fastest journey to {destination} takes {} min, limit {} min",
                fastest.as_secs() / 60,
                maximum.as_secs() / 60
            ),
            RejectionReason::LookupFailed { destination, error } => {
                write!(f, "journey lookup to {destination} failed: {error}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectionReason),
}

/// Outcome of one journey lookup, by how the caller must treat it.
#[derive(Debug, Clone, PartialEq)]
pub enum JourneyLookup {
    Found(Vec<Journey>),
    Ambiguous,
    NotFound,
    TransientError(ApiError),
    QuotaError(ApiError),
}

impl JourneyLookup {
    pub fn from_response(result: Result<RoutingResponse, ApiError>) -> Self {
        match result {
            Ok(RoutingResponse::Journeys(journeys)) => JourneyLookup::Found(journeys),
            Ok(RoutingResponse::Disambiguation) => JourneyLookup::Ambiguous,
            Err(ApiError::NotFound(_)) => JourneyLookup::NotFound,
            Err(error @ (ApiError::QuotaExceeded { .. } | ApiError::RateLimited { .. })) => {
                JourneyLookup::QuotaError(error)
            }
            Err(error) => JourneyLookup::TransientError(error),
        }
    }

    // Terminal answers are safe to remember; failures are not
    pub fn cacheable_journeys(&self) -> Option<Vec<Journey>> {
        match self {
            JourneyLookup::Found(journeys) => Some(journeys.clone()),
            JourneyLookup::Ambiguous | JourneyLookup::NotFound => Some(Vec::new()),
            JourneyLookup::TransientError(_) | JourneyLookup::QuotaError(_) => None,
        }
    }
}

#[async_trait]
pub trait JourneySource: Send + Sync {
    async fn journeys(&self, origin: Coordinate, destination: Coordinate) -> JourneyLookup;
}

/// Every check that needs no journey lookup, in order: category, price
/// presence, size floor, availability marker, price ceiling, recency.
///
/// An unknown price frequency is an error rather than a rejection.
pub fn screen(
    listing: &Listing,
    constraints: &Constraints,
    now: DateTime<Utc>,
) -> Result<Verdict, ListingError> {
    let reject = |reason| Ok(Verdict::Rejected(reason));

    if listing.categories.any() {
        return reject(RejectionReason::Category);
    }

    let Some(price) = &listing.price else {
        return reject(RejectionReason::MissingPrice);
    };

    // Unparseable descriptors pass
    if let (Some(minimum), Some(square_meters)) =
        (constraints.min_square_meters, listing.area_square_meters())
    {
        if square_meters < minimum {
            return reject(RejectionReason::TooSmall {
                square_meters,
                minimum,
            });
        }
    }

    if listing.is_under_agreement() {
        return reject(RejectionReason::Unavailable);
    }

    let monthly = price.monthly()?.value();
    if let Some(maximum) = constraints.max_price {
        if monthly > maximum {
            return reject(RejectionReason::TooExpensive { monthly, maximum });
        }
    }

    if let (Some(maximum), Some(first_seen)) = (constraints.max_age_days, listing.first_seen) {
        let age_days = (now - first_seen).num_days();
        if age_days > maximum {
            return reject(RejectionReason::TooOld { age_days, maximum });
        }
    }

    Ok(Verdict::Accepted)
}

/// Full evaluation: `screen`, then the commute to each destination in order,
/// stopping at the first destination that fails.
pub async fn evaluate(
    listing: &Listing,
    constraints: &Constraints,
    now: DateTime<Utc>,
    source: &dyn JourneySource,
) -> Result<Verdict, ListingError> {
    if let Verdict::Rejected(reason) = screen(listing, constraints, now)? {
        return Ok(Verdict::Rejected(reason));
    }

    for destination in &constraints.destinations {
        let name = destination.name.clone();
        let journeys = match source.journeys(listing.location, destination.location).await {
            JourneyLookup::Found(journeys) => journeys,
            JourneyLookup::Ambiguous | JourneyLookup::NotFound => Vec::new(),
            JourneyLookup::TransientError(error) | JourneyLookup::QuotaError(error) => {
                return Ok(Verdict::Rejected(RejectionReason::LookupFailed {
                    destination: name,
                    error,
                }));
            }
        };

        let Some(fastest) = journeys.iter().map(|j| j.duration).min() else {
            return Ok(Verdict::Rejected(RejectionReason::NoJourney { destination: name }));
        };
        if fastest > destination.max_commute {
            return Ok(Verdict::Rejected(RejectionReason::CommuteTooLong {
                destination: name,
                fastest,
                maximum: destination.max_commute,
            }));
        }
    }

    Ok(Verdict::Accepted)
}

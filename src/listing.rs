// Listing data model: price normalization, size descriptors and availability markers

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::Coordinate;

pub type ListingId = u64;

const SQUARE_FEET_TO_METERS: f64 = 0.092903;

// Lozenge types the search system attaches once a listing is under agreement
const UNAVAILABLE_LOZENGES: &[&str] = &["LET_AGREED", "SOLD_STC"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ListingError {
    #[error("Unknown price frequency: {0:?}")]
    UnknownFrequency(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Monthly,
    Weekly,
    Daily,
    Yearly,
}

impl FromStr for Frequency {
    type Err = ListingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Frequency::Monthly),
            "weekly" => Ok(Frequency::Weekly),
            "daily" => Ok(Frequency::Daily),
            "yearly" => Ok(Frequency::Yearly),
            _ => Err(ListingError::UnknownFrequency(s.to_string())),
        }
    }
}

/// Monthly-equivalent price.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct NormalizedPrice(f64);

impl NormalizedPrice {
    pub fn from_amount(amount: f64, frequency: Frequency) -> Self {
        let monthly = match frequency {
            Frequency::Monthly => amount,
            Frequency::Weekly => amount * 52.0 / 12.0,
            Frequency::Daily => amount * 365.0 / 12.0,
            Frequency::Yearly => amount / 12.0,
        };
        Self(monthly)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

// The frequency stays a raw string as delivered by the detail endpoint; it is
// only validated when the price is normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub frequency: String,
}

impl Price {
    pub fn new(amount: f64, frequency: impl Into<String>) -> Self {
        Self {
            amount,
            frequency: frequency.into(),
        }
    }

    pub fn monthly(&self) -> Result<NormalizedPrice, ListingError> {
        let frequency = self.frequency.parse::<Frequency>()?;
        Ok(NormalizedPrice::from_amount(self.amount, frequency))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryFlags {
    pub commercial: bool,
    pub development: bool,
    pub student: bool,
    pub auction: bool,
}

impl CategoryFlags {
    pub fn any(&self) -> bool {
        self.commercial || self.development || self.student || self.auction
    }
}

// Summary returned by the capped search endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ListingLocation {
    pub id: ListingId,
    pub location: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub location: Coordinate,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub categories: CategoryFlags,
    #[serde(default)]
    pub display_size: Option<String>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lozenges: Vec<String>,
    #[serde(default)]
    pub display_address: Option<String>,
}

impl Listing {
    pub fn new(id: ListingId, location: Coordinate) -> Self {
        Self {
            id,
            location,
            price: None,
            categories: CategoryFlags::default(),
            display_size: None,
            first_seen: None,
            lozenges: Vec::new(),
            display_address: None,
        }
    }

    /// Whether a let agreed / sold subject to contract marker is present.
    pub fn is_under_agreement(&self) -> bool {
        self.lozenges
            .iter()
            .any(|lozenge| UNAVAILABLE_LOZENGES.contains(&lozenge.as_str()))
    }

    pub fn area_square_meters(&self) -> Option<f64> {
        self.display_size.as_deref().and_then(parse_area)
    }

    pub fn label(&self) -> &str {
        self.display_address.as_deref().unwrap_or("<no address>")
    }
}

/// Parses a size descriptor such as `"650 sq. ft."` or `"1,200 sqm"` into
/// whole square meters. Returns `None` for anything else.
pub fn parse_area(descriptor: &str) -> Option<f64> {
    let descriptor = descriptor.trim();
    let number = |raw: &str| raw.trim().replace(',', "").parse::<f64>().ok();

    for suffix in ["sq. ft.", "sq ft", "sqft"] {
        if let Some(raw) = descriptor.strip_suffix(suffix) {
            return number(raw).map(|feet| (feet * SQUARE_FEET_TO_METERS).floor());
        }
    }
    for suffix in ["sqm", "sq. m.", "m²"] {
        if let Some(raw) = descriptor.strip_suffix(suffix) {
            return number(raw).map(f64::floor);
        }
    }
    None
}

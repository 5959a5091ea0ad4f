// Coordinates and bounding boxes shared by area discovery, routing and the journey cache.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("Inverted bounding box: min {min} is not below max {max}")]
    InvertedBox { min: Coordinate, max: Coordinate },

    #[error("Non-finite coordinate: {0}")]
    NonFinite(Coordinate),
}

/// A WGS84 latitude/longitude pair.
///
/// Equality and hashing are by value, so a coordinate can key the journey
/// cache. `-0.0` and `0.0` compare equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }

    fn key_bits(&self) -> (u64, u64) {
        (canonical(self.latitude), canonical(self.longitude))
    }
}

fn canonical(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.key_bits() == other.key_bits()
    }
}

impl Eq for Coordinate {}

impl Hash for Coordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_bits().hash(state);
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// Axis-aligned region with `min <= max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    min: Coordinate,
    max: Coordinate,
}

impl BoundingBox {
    pub fn new(min: Coordinate, max: Coordinate) -> Result<Self, GeoError> {
        if !min.is_finite() {
            return Err(GeoError::NonFinite(min));
        }
        if !max.is_finite() {
            return Err(GeoError::NonFinite(max));
        }
        if min.latitude > max.latitude || min.longitude > max.longitude {
            return Err(GeoError::InvertedBox { min, max });
        }
        Ok(Self { min, max })
    }

    // Smallest box holding every vertex, e.g. of a postcode boundary polyline.
    pub fn enclosing(points: &[Coordinate]) -> Option<Self> {
        let first = points.first()?;
        let (mut min, mut max) = (*first, *first);
        for point in &points[1..] {
            min.latitude = min.latitude.min(point.latitude);
            min.longitude = min.longitude.min(point.longitude);
            max.latitude = max.latitude.max(point.latitude);
            max.longitude = max.longitude.max(point.longitude);
        }
        Self::new(min, max).ok()
    }

    pub fn min(&self) -> Coordinate {
        self.min
    }

    pub fn max(&self) -> Coordinate {
        self.max
    }

    pub fn latitude_span(&self) -> f64 {
        self.max.latitude - self.min.latitude
    }

    pub fn longitude_span(&self) -> f64 {
        self.max.longitude - self.min.longitude
    }

    pub fn midpoint(&self) -> Coordinate {
        Coordinate::new(
            (self.min.latitude + self.max.latitude) / 2.0,
            (self.min.longitude + self.max.longitude) / 2.0,
        )
    }

    // Inclusive on every edge.
    pub fn contains(&self, point: &Coordinate) -> bool {
        point.latitude >= self.min.latitude
            && point.latitude <= self.max.latitude
            && point.longitude >= self.min.longitude
            && point.longitude <= self.max.longitude
    }

    /// Splits the box at its midpoint along every axis that can still shrink.
    /// A full split yields south-west, south-east, north-west and north-east
    /// quadrants; a box that is flat or stuck on one axis yields two halves.
    /// The pieces are distinct and together cover the parent exactly. A box
    /// for which [`is_below`](Self::is_below) holds comes back unchanged.
    pub fn subdivide(&self, min_delta: f64) -> Vec<BoundingBox> {
        let mid = self.midpoint();
        let (min, max) = (self.min, self.max);
        let latitudes = if axis_splits(min.latitude, mid.latitude, max.latitude, min_delta) {
            vec![(min.latitude, mid.latitude), (mid.latitude, max.latitude)]
        } else {
            vec![(min.latitude, max.latitude)]
        };
        let longitudes = if axis_splits(min.longitude, mid.longitude, max.longitude, min_delta) {
            vec![(min.longitude, mid.longitude), (mid.longitude, max.longitude)]
        } else {
            vec![(min.longitude, max.longitude)]
        };

        latitudes
            .iter()
            .flat_map(|&(south, north)| {
                longitudes.iter().map(move |&(west, east)| Self {
                    min: Coordinate::new(south, west),
                    max: Coordinate::new(north, east),
                })
            })
            .collect()
    }

    /// True when subdividing can no longer shrink the box meaningfully: on
    /// each axis the span is within `min_delta` or the midpoint collapses
    /// onto an edge.
    pub fn is_below(&self, min_delta: f64) -> bool {
        let mid = self.midpoint();
        !axis_splits(self.min.latitude, mid.latitude, self.max.latitude, min_delta)
            && !axis_splits(self.min.longitude, mid.longitude, self.max.longitude, min_delta)
    }

    /// Closed ring of five vertices (first repeated last), counter-clockwise
    /// from the south-west corner. This is the polygon shape the search
    /// endpoint accepts.
    pub fn to_polygon(&self) -> Vec<Coordinate> {
        let (min, max) = (self.min, self.max);
        vec![
            min,
            Coordinate::new(min.latitude, max.longitude),
            max,
            Coordinate::new(max.latitude, min.longitude),
            min,
        ]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.min, self.max)
    }
}

fn axis_splits(low: f64, mid: f64, high: f64, min_delta: f64) -> bool {
    high - low > min_delta && mid > low && mid < high
}

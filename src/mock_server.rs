// In-process fakes of the external endpoints, for tests and local experiments.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    api::{
        ApiError, DetailApi, Journey, JourneyQuery, Mode, RoutingApi, RoutingResponse, SearchApi,
        SearchPage,
    },
    cache::JourneyKey,
    geo::{BoundingBox, Coordinate},
    listing::{Listing, ListingId, ListingLocation},
};

// A journey of `minutes` arriving at `arrival`
pub fn journey(minutes: u64, arrival: DateTime<Utc>) -> Journey {
    Journey {
        duration: Duration::from_secs(minutes * 60),
        departure: arrival - chrono::Duration::minutes(minutes as i64),
        arrival,
        mode: Mode::Tube,
        route: format!("{minutes} minute route"),
    }
}

/// Deterministic search index over a fixed listing set. Each query reports
/// the true match count but returns at most `cap` summaries.
pub struct MockSearchIndex {
    listings: Vec<ListingLocation>,
    cap: usize,
    calls: AtomicUsize,
    failures: Mutex<VecDeque<ApiError>>,
    failing_boxes: Mutex<Vec<BoundingBox>>,
}

impl MockSearchIndex {
    pub fn new(listings: Vec<ListingLocation>, cap: usize) -> Self {
        Self {
            listings,
            cap,
            calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            failing_boxes: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    // The next queries fail with these errors, in order
    pub async fn fail_next(&self, errors: Vec<ApiError>) {
        self.failures.lock().await.extend(errors);
    }

    // Queries for exactly this box always fail
    pub async fn fail_box(&self, bbox: BoundingBox) {
        self.failing_boxes.lock().await.push(bbox);
    }

    pub fn ids_within(&self, bbox: &BoundingBox) -> HashSet<ListingId> {
        self.listings
            .iter()
            .filter(|l| bbox.contains(&l.location))
            .map(|l| l.id)
            .collect()
    }
}

#[async_trait]
impl SearchApi for MockSearchIndex {
    async fn search(&self, polygon: &[Coordinate]) -> Result<SearchPage, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }
        let bbox = BoundingBox::enclosing(polygon)
            .ok_or_else(|| ApiError::DecodeError("empty polygon".into()))?;
        if self.failing_boxes.lock().await.contains(&bbox) {
            return Err(ApiError::ApiResponseError {
                status_code: 503,
                message: "Service temporarily unavailable".into(),
            });
        }

        let matching: Vec<ListingLocation> = self
            .listings
            .iter()
            .filter(|l| bbox.contains(&l.location))
            .copied()
            .collect();
        Ok(SearchPage {
            total_count: matching.len(),
            listings: matching.into_iter().take(self.cap).collect(),
        })
    }
}

// Batch detail endpoint. A batch containing a poisoned id fails as a whole.
pub struct MockDetailServer {
    listings: HashMap<ListingId, Listing>,
    poisoned: HashSet<ListingId>,
    calls: AtomicUsize,
}

impl MockDetailServer {
    pub fn new(listings: Vec<Listing>, poisoned: HashSet<ListingId>) -> Self {
        Self {
            listings: listings.into_iter().map(|l| (l.id, l)).collect(),
            poisoned,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetailApi for MockDetailServer {
    async fn fetch_details(&self, ids: &[ListingId]) -> Result<Vec<Listing>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(id) = ids.iter().find(|id| self.poisoned.contains(id)) {
            return Err(ApiError::ApiResponseError {
                status_code: 400,
                message: format!("invalid property id {id}"),
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.listings.get(id).cloned())
            .collect())
    }
}

/// Routing endpoint answering from a route table. Unknown pairs are
/// `NotFound`; origins registered with `fail_origin` always error.
#[derive(Default)]
pub struct MockRoutingServer {
    routes: DashMap<JourneyKey, RoutingResponse>,
    failing_origins: DashMap<Coordinate, ApiError>,
    calls: AtomicUsize,
    calls_by_origin: DashMap<Coordinate, usize>,
    delay_ms: AtomicUsize,
}

impl MockRoutingServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, origin: Coordinate, destination: Coordinate, response: RoutingResponse) {
        self.routes.insert(JourneyKey::new(origin, destination), response);
    }

    pub fn fail_origin(&self, origin: Coordinate, error: ApiError) {
        self.failing_origins.insert(origin, error);
    }

    pub fn set_delay(&self, delay_ms: usize) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_from(&self, origin: Coordinate) -> usize {
        self.calls_by_origin.get(&origin).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl RoutingApi for MockRoutingServer {
    async fn journey_results(&self, query: &JourneyQuery) -> Result<RoutingResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_origin.entry(query.origin).or_insert(0) += 1;

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if let Some(error) = self.failing_origins.get(&query.origin) {
            return Err(error.clone());
        }
        self.routes
            .get(&JourneyKey::new(query.origin, query.destination))
            .map(|response| response.clone())
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "no journey from {} to {}",
                    query.origin, query.destination
                ))
            })
    }
}

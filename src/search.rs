// Area discovery against a search endpoint that caps the results of one query.
// Regions over the cap are split into quadrants (or halves, for a box flat
// on one axis) until every piece fits.

use std::{collections::HashSet, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiError, SearchApi, SearchPage},
    geo::BoundingBox,
    listing::{Listing, ListingId},
    rate_limiter::RateLimiter,
    retry::RetryPolicy,
};

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search failed for region {bbox}: {source}")]
    Region {
        bbox: BoundingBox,
        source: ApiError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    // Largest total the endpoint still returns in full
    pub result_cap: usize,
    pub min_box_delta: f64,
    // Upper bound of the random pause before each query after the first
    pub sibling_delay_ms: u64,
    pub best_effort: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            result_cap: 499,
            min_box_delta: 1e-6,
            sibling_delay_ms: 1000,
            best_effort: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubdivisionTask {
    pub bbox: BoundingBox,
    pub depth: u32,
}

pub struct AreaSearcher {
    api: Arc<dyn SearchApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    config: SearchConfig,
}

impl AreaSearcher {
    pub fn new(
        api: Arc<dyn SearchApi>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        config: SearchConfig,
    ) -> Self {
        Self {
            api,
            limiter,
            retry,
            config,
        }
    }

    /// Every listing identifier inside `bbox`.
    ///
    /// A region whose total is within the cap is taken as complete; otherwise
    /// its pieces from [`BoundingBox::subdivide`] are searched instead, four
    /// quadrants or two halves when one axis can no longer shrink. A region
    /// too small to split further is accepted as-is with a warning even when over the cap.
    pub async fn search_area(&self, bbox: BoundingBox) -> Result<HashSet<ListingId>, SearchError> {
        let mut found = HashSet::new();
        let mut pending = vec![SubdivisionTask { bbox, depth: 0 }];
        let mut queries = 0usize;

        while let Some(task) = pending.pop() {
            if queries > 0 {
                self.pause_between_queries().await;
            }
            queries += 1;

            let page = match self.query(&task.bbox).await {
                Ok(page) => page,
                Err(source) if self.config.best_effort => {
                    warn!(bbox = %task.bbox, error = %source, "Skipping failed region");
                    continue;
                }
                Err(source) => {
                    return Err(SearchError::Region {
                        bbox: task.bbox,
                        source,
                    })
                }
            };

            if page.total_count <= self.config.result_cap {
                debug!(
                    bbox = %task.bbox,
                    depth = task.depth,
                    count = page.total_count,
                    "Region complete"
                );
                found.extend(page.listings.iter().map(|l| l.id));
            } else if task.bbox.is_below(self.config.min_box_delta) {
                warn!(
                    bbox = %task.bbox,
                    depth = task.depth,
                    total = page.total_count,
                    returned = page.listings.len(),
                    "Region over result cap but too small to split, results may be incomplete"
                );
                found.extend(page.listings.iter().map(|l| l.id));
            } else {
                debug!(
                    bbox = %task.bbox,
                    depth = task.depth,
                    total = page.total_count,
                    "Region over result cap, subdividing"
                );
                let pieces = task.bbox.subdivide(self.config.min_box_delta);
                pending.extend(pieces.into_iter().map(|bbox| SubdivisionTask {
                    bbox,
                    depth: task.depth + 1,
                }));
            }
        }

        info!(bbox = %bbox, queries, listings = found.len(), "Area search finished");
        Ok(found)
    }

    // Union over several regions, sorted
    pub async fn discover_all(&self, regions: &[BoundingBox]) -> Result<Vec<ListingId>, SearchError> {
        let mut all = HashSet::new();
        for region in regions {
            all.extend(self.search_area(*region).await?);
        }
        let mut ids: Vec<ListingId> = all.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Drops identifiers whose listing in `history` is already let or sold
    /// subject to contract. Returns how many were removed.
    pub fn exclude_unavailable(ids: &mut HashSet<ListingId>, history: &[Listing]) -> usize {
        let before = ids.len();
        for listing in history.iter().filter(|l| l.is_under_agreement()) {
            ids.remove(&listing.id);
        }
        before - ids.len()
    }

    async fn query(&self, bbox: &BoundingBox) -> Result<SearchPage, ApiError> {
        let polygon = bbox.to_polygon();
        let (api, limiter, polygon) = (&self.api, &self.limiter, &polygon);
        self.retry
            .run(|| async move {
                let _permit = limiter.acquire().await;
                api.search(polygon).await
            })
            .await
    }

    async fn pause_between_queries(&self) {
        if self.config.sibling_delay_ms == 0 {
            return;
        }
        let delay_ms = rand::thread_rng().gen_range(0..=self.config.sibling_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

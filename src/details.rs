// Batch detail fetch for discovered identifiers

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    api::{ApiError, DetailApi},
    listing::{Listing, ListingId},
    rate_limiter::RateLimiter,
    retry::RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailConfig {
    pub batch_size: usize,
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self { batch_size: 25 }
    }
}

pub struct DetailFetcher {
    api: Arc<dyn DetailApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    config: DetailConfig,
}

impl DetailFetcher {
    pub fn new(
        api: Arc<dyn DetailApi>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        config: DetailConfig,
    ) -> Self {
        Self {
            api,
            limiter,
            retry,
            config,
        }
    }

    /// Fetches full listings in batches. A failed batch is retried one
    /// identifier at a time so a single bad identifier only loses itself;
    /// identifiers that still fail are logged and skipped.
    pub async fn fetch_listings(&self, ids: &[ListingId]) -> Vec<Listing> {
        let mut listings = Vec::with_capacity(ids.len());

        for batch in ids.chunks(self.config.batch_size.max(1)) {
            match self.fetch(batch).await {
                Ok(fetched) => listings.extend(fetched),
                Err(error) => {
                    warn!(%error, size = batch.len(), "Detail batch failed, fetching one by one");
                    for id in batch {
                        match self.fetch(std::slice::from_ref(id)).await {
                            Ok(fetched) => listings.extend(fetched),
                            Err(error) => warn!(id, %error, "Skipping listing without details"),
                        }
                    }
                }
            }
            debug!(fetched = listings.len(), "Detail batch done");
        }

        info!(requested = ids.len(), fetched = listings.len(), "Fetched listing details");
        listings
    }

    async fn fetch(&self, ids: &[ListingId]) -> Result<Vec<Listing>, ApiError> {
        let (api, limiter) = (&self.api, &self.limiter);
        self.retry
            .run(|| async move {
                let _permit = limiter.acquire().await;
                api.fetch_details(ids).await
            })
            .await
    }
}

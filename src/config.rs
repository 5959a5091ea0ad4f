// Aggregated settings. Every section falls back to its defaults, so a
// document only needs the values it changes.

use serde::{Deserialize, Serialize};

use crate::{
    details::DetailConfig,
    http::HttpRoutingConfig,
    pipeline::PipelineConfig,
    rate_limiter::RateLimitConfig,
    retry::{QuotaRetryConfig, RetryConfig, RetryPolicy},
    search::SearchConfig,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub search: SearchConfig,
    pub details: DetailConfig,
    pub routing_rate_limit: RateLimitConfig,
    pub routing: HttpRoutingConfig,
    pub retry: RetryConfig,
    pub quota_retry: QuotaRetryConfig,
    pub pipeline: PipelineConfig,
}

impl ScoutConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone(), self.quota_retry.clone())
    }
}

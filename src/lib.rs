// Listing discovery and commute filtering

pub mod api;
pub mod cache;
pub mod config;
pub mod details;
pub mod geo;
pub mod http;
pub mod ledger;
pub mod listing;
pub mod mock_server;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod search;
pub mod suitability;

// Re-export key types for convenience
pub use api::{ApiError, DetailApi, Journey, JourneyQuery, Mode, RoutingApi, RoutingResponse, SearchApi};
pub use cache::{CacheError, CacheStats, CacheStore, FileStore, JourneyCache, MemoryStore};
pub use config::ScoutConfig;
pub use details::DetailFetcher;
pub use geo::{BoundingBox, Coordinate};
pub use http::HttpRoutingClient;
pub use ledger::{LedgerError, SeenLedger};
pub use listing::{Listing, ListingError, NormalizedPrice, Price};
pub use pipeline::{FilterPipeline, FilterRun, PipelineError, PipelineState, PipelineStats};
pub use rate_limiter::{RateLimiter, RatePermit};
pub use retry::RetryPolicy;
pub use search::{AreaSearcher, SearchError};
pub use suitability::{Constraints, Destination, RejectionReason, Verdict};

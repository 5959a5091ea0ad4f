// Concurrent evaluation of many listings against one set of constraints.
// Accepted listings are streamed out in completion order.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Notify, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    api::{next_weekday_arrival, JourneyQuery, Mode, RoutingApi},
    cache::JourneyCache,
    geo::Coordinate,
    ledger::SeenLedger,
    listing::{Listing, ListingError},
    rate_limiter::RateLimiter,
    retry::RetryPolicy,
    suitability::{self, Constraints, JourneyLookup, JourneySource, Verdict},
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline already started (state {0:?})")]
    AlreadyStarted(PipelineState),

    #[error("Malformed constraint: {0}")]
    MalformedConstraint(#[from] ListingError),

    #[error("Arrival hour {0} is outside 0-23")]
    InvalidArrivalHour(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    // Accepted listings buffered ahead of the consumer
    pub channel_capacity: usize,
    // Target arrival hour (UTC) on the next weekday
    pub arrival_hour: u32,
    pub modes: Vec<Mode>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            channel_capacity: 64,
            arrival_hour: 9,
            modes: Mode::default_allowed(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub skipped_seen: AtomicUsize,
    pub evaluated: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub live_lookups: AtomicUsize,
    pub failed_lookups: AtomicUsize,
    rejections: DashMap<&'static str, usize>,
}

impl PipelineStats {
    fn record_rejection(&self, kind: &'static str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        *self.rejections.entry(kind).or_insert(0) += 1;
    }

    // Rejections counted under a `RejectionReason::kind` label
    pub fn rejected_for(&self, kind: &str) -> usize {
        self.rejections.get(kind).map(|n| *n).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct CancelToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Journey lookups for one run: the cache first, then the routing API
/// through the limiter and retry policy. Definite answers (journeys, no
/// route, ambiguous location) are written back; failures are not.
///
/// Two workers missing the same pair may both query the API.
pub struct CachedRouter {
    api: Arc<dyn RoutingApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    cache: Option<Arc<JourneyCache>>,
    arrival: DateTime<Utc>,
    modes: Vec<Mode>,
    stats: Arc<PipelineStats>,
}

impl CachedRouter {
    async fn remember(&self, origin: Coordinate, destination: Coordinate, lookup: &JourneyLookup) {
        let (Some(cache), Some(journeys)) = (&self.cache, lookup.cacheable_journeys()) else {
            return;
        };
        let cache = cache.clone();
        match tokio::task::spawn_blocking(move || cache.put(origin, destination, journeys)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%origin, %destination, error = %e, "Journey cache write failed, entry discarded")
            }
            Err(e) => error!(%origin, %destination, error = %e, "Journey cache write aborted"),
        }
    }
}

#[async_trait]
impl JourneySource for CachedRouter {
    async fn journeys(&self, origin: Coordinate, destination: Coordinate) -> JourneyLookup {
        if let Some(journeys) = self.cache.as_ref().and_then(|c| c.get(origin, destination)) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(%origin, %destination, "Journey cache hit");
            return JourneyLookup::Found(journeys);
        }

        self.stats.live_lookups.fetch_add(1, Ordering::Relaxed);
        let query = JourneyQuery {
            origin,
            destination,
            arrival: self.arrival,
            modes: self.modes.clone(),
        };
        let (api, limiter, query) = (&self.api, &self.limiter, &query);
        let result = self
            .retry
            .run(|| async move {
                let _permit = limiter.acquire().await;
                api.journey_results(query).await
            })
            .await;

        let lookup = JourneyLookup::from_response(result);
        match &lookup {
            JourneyLookup::TransientError(e) | JourneyLookup::QuotaError(e) => {
                self.stats.failed_lookups.fetch_add(1, Ordering::Relaxed);
                warn!(%origin, %destination, error = %e, "Journey lookup failed");
            }
            _ => self.remember(origin, destination, &lookup).await,
        }
        lookup
    }
}

struct RunContext {
    router: CachedRouter,
    constraints: Constraints,
    now: DateTime<Utc>,
    seen: Option<Arc<SeenLedger>>,
    cancel: Arc<CancelToken>,
    stats: Arc<PipelineStats>,
    state: Arc<Mutex<PipelineState>>,
    workers: usize,
}

type RunItem = Result<Listing, PipelineError>;

impl RunContext {
    async fn dispatch(self: Arc<Self>, listings: Vec<Listing>, tx: mpsc::Sender<RunItem>) {
        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut tasks = JoinSet::new();

        for listing in listings {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.seen.as_ref().is_some_and(|seen| seen.contains(listing.id)) {
                self.stats.skipped_seen.fetch_add(1, Ordering::Relaxed);
                debug!(id = listing.id, "Skipping already seen listing");
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            let ctx = self.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                ctx.evaluate_one(listing, &tx).await;
            });
        }

        // In-flight evaluations finish unless the run is cancelled meanwhile
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => error!(error = %e, "Evaluation task panicked"),
                    Some(_) => {}
                    None => break,
                },
                _ = self.cancel.cancelled() => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let state = if self.cancel.is_cancelled() {
            PipelineState::Cancelled
        } else {
            PipelineState::Completed
        };
        *self.state.lock() = state;
        info!(
            ?state,
            evaluated = self.stats.evaluated.load(Ordering::Relaxed),
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            rejected = self.stats.rejected.load(Ordering::Relaxed),
            skipped_seen = self.stats.skipped_seen.load(Ordering::Relaxed),
            live_lookups = self.stats.live_lookups.load(Ordering::Relaxed),
            cache_hits = self.stats.cache_hits.load(Ordering::Relaxed),
            "Filter run finished"
        );
        drop(tx);
    }

    async fn evaluate_one(&self, listing: Listing, tx: &mpsc::Sender<RunItem>) {
        let verdict =
            suitability::evaluate(&listing, &self.constraints, self.now, &self.router).await;
        self.stats.evaluated.fetch_add(1, Ordering::Relaxed);

        match verdict {
            Ok(Verdict::Accepted) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                info!(id = listing.id, address = listing.label(), "Listing accepted");
                // A closed channel means the consumer went away
                let _ = tx.send(Ok(listing)).await;
            }
            Ok(Verdict::Rejected(reason)) => {
                self.stats.record_rejection(reason.kind());
                debug!(id = listing.id, %reason, "Listing rejected");
            }
            Err(e) => {
                error!(id = listing.id, error = %e, "Malformed listing data, stopping run");
                let _ = tx.send(Err(e.into())).await;
                self.cancel.cancel();
            }
        }
    }
}

/// One-shot filter over a listing set.
///
/// `filter` may be called once; the pipeline then moves from `Created` to
/// `Running` and ends `Completed` or `Cancelled`.
pub struct FilterPipeline {
    api: Arc<dyn RoutingApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    config: PipelineConfig,
    cache: Option<Arc<JourneyCache>>,
    seen: Option<Arc<SeenLedger>>,
    arrival: Option<DateTime<Utc>>,
    state: Arc<Mutex<PipelineState>>,
    stats: Arc<PipelineStats>,
}

impl FilterPipeline {
    pub fn new(
        api: Arc<dyn RoutingApi>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        config: PipelineConfig,
    ) -> Self {
        Self {
            api,
            limiter,
            retry,
            config,
            cache: None,
            seen: None,
            arrival: None,
            state: Arc::new(Mutex::new(PipelineState::Created)),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<JourneyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_seen_ledger(mut self, seen: Arc<SeenLedger>) -> Self {
        self.seen = Some(seen);
        self
    }

    // Overrides the next-weekday-morning arrival time
    pub fn with_arrival(mut self, arrival: DateTime<Utc>) -> Self {
        self.arrival = Some(arrival);
        self
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Starts evaluating `listings` on the current tokio runtime. Listings in
    /// the seen ledger are skipped without any lookup.
    pub fn filter(
        &self,
        listings: Vec<Listing>,
        constraints: Constraints,
    ) -> Result<FilterRun, PipelineError> {
        let arrival_hour = self.config.arrival_hour;
        let arrival_at = NaiveTime::from_hms_opt(arrival_hour, 0, 0)
            .ok_or(PipelineError::InvalidArrivalHour(arrival_hour))?;
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Created {
                return Err(PipelineError::AlreadyStarted(*state));
            }
            *state = PipelineState::Running;
        }

        let now = Utc::now();
        let arrival = self
            .arrival
            .unwrap_or_else(|| next_weekday_arrival(now, arrival_at));
        info!(
            listings = listings.len(),
            destinations = constraints.destinations.len(),
            workers = self.config.workers,
            %arrival,
            "Starting filter run"
        );

        let cancel = Arc::new(CancelToken::default());
        let ctx = Arc::new(RunContext {
            router: CachedRouter {
                api: self.api.clone(),
                limiter: self.limiter.clone(),
                retry: self.retry.clone(),
                cache: self.cache.clone(),
                arrival,
                modes: self.config.modes.clone(),
                stats: self.stats.clone(),
            },
            constraints,
            now,
            seen: self.seen.clone(),
            cancel: cancel.clone(),
            stats: self.stats.clone(),
            state: self.state.clone(),
            workers: self.config.workers,
        });

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tokio::spawn(ctx.dispatch(listings, tx));

        Ok(FilterRun { rx, cancel })
    }
}

/// Accepted listings of one run, in the order their evaluations finished.
/// A malformed listing shows up as an `Err` item and stops the run.
///
/// Dropping the run cancels it.
pub struct FilterRun {
    rx: mpsc::Receiver<RunItem>,
    cancel: Arc<CancelToken>,
}

impl FilterRun {
    /// Stops dispatching and abandons in-flight evaluations. Listings already
    /// delivered stay valid.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn collect_accepted(mut self) -> Result<Vec<Listing>, PipelineError> {
        let mut accepted = Vec::new();
        while let Some(item) = self.next().await {
            accepted.push(item?);
        }
        Ok(accepted)
    }
}

impl Stream for FilterRun {
    type Item = RunItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for FilterRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{ApiError, RoutingResponse},
        cache::MemoryStore,
        listing::Price,
        mock_server::{journey, MockRoutingServer},
        retry::{QuotaRetryConfig, RetryConfig},
        suitability::Destination,
    };
    use chrono::TimeZone;
    use std::{collections::HashSet, time::Duration};

    fn arrival() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn office() -> Coordinate {
        Coordinate::new(51.515, -0.09)
    }

    fn gym() -> Coordinate {
        Coordinate::new(51.53, -0.12)
    }

    fn constraints() -> Constraints {
        Constraints {
            max_price: Some(2000.0),
            destinations: vec![
                Destination::new("office", office(), Duration::from_secs(45 * 60)),
                Destination::new("gym", gym(), Duration::from_secs(45 * 60)),
            ],
            ..Default::default()
        }
    }

    fn listing(id: u64, amount: f64) -> Listing {
        let mut listing = Listing::new(id, Coordinate::new(51.4 + id as f64 / 100.0, -0.2));
        listing.price = Some(Price::new(amount, "monthly"));
        listing
    }

    fn route(server: &MockRoutingServer, origin: &Listing, destination: Coordinate, minutes: u64) {
        server.add_route(
            origin.location,
            destination,
            RoutingResponse::Journeys(vec![journey(minutes, arrival())]),
        );
    }

    struct Scenario {
        routing: Arc<MockRoutingServer>,
        listings: Vec<Listing>,
    }

    // A accepted, B too expensive, C commute too long, D auction
    fn scenario() -> Scenario {
        let routing = Arc::new(MockRoutingServer::new());
        let a = listing(1, 1800.0);
        let b = listing(2, 2500.0);
        let c = listing(3, 1900.0);
        let mut d = listing(4, 1500.0);
        d.categories.auction = true;

        route(&routing, &a, office(), 30);
        route(&routing, &a, gym(), 40);
        route(&routing, &c, office(), 30);
        route(&routing, &c, gym(), 50);
        for l in [&b, &d] {
            route(&routing, l, office(), 10);
            route(&routing, l, gym(), 10);
        }

        Scenario {
            routing,
            listings: vec![a, b, c, d],
        }
    }

    fn pipeline(routing: Arc<MockRoutingServer>, retry: RetryPolicy) -> FilterPipeline {
        FilterPipeline::new(
            routing,
            Arc::new(RateLimiter::new(500, Duration::from_secs(60))),
            retry,
            PipelineConfig {
                workers: 4,
                ..Default::default()
            },
        )
        .with_arrival(arrival())
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn ids(listings: &[Listing]) -> HashSet<u64> {
        listings.iter().map(|l| l.id).collect()
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        init_tracing();
        let Scenario { routing, listings } = scenario();
        let d_origin = listings[3].location;
        let b_origin = listings[1].location;
        let pipeline = pipeline(routing.clone(), RetryPolicy::none());

        let accepted = pipeline
            .filter(listings, constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();

        assert_eq!(ids(&accepted), [1].into_iter().collect());
        assert_eq!(routing.calls_from(d_origin), 0);
        assert_eq!(routing.calls_from(b_origin), 0);
        assert_eq!(pipeline.state(), PipelineState::Completed);

        let stats = pipeline.stats();
        assert_eq!(stats.evaluated.load(Ordering::Relaxed), 4);
        assert_eq!(stats.accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.rejected_for("too_expensive"), 1);
        assert_eq!(stats.rejected_for("commute_too_long"), 1);
        assert_eq!(stats.rejected_for("category"), 1);
    }

    #[tokio::test]
    async fn test_second_run_served_from_cache() {
        let Scenario { routing, listings } = scenario();
        let cache = Arc::new(JourneyCache::open(MemoryStore::new(), false).unwrap());

        let first = pipeline(routing.clone(), RetryPolicy::none()).with_cache(cache.clone());
        let accepted = first
            .filter(listings.clone(), constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();
        assert_eq!(accepted.len(), 1);
        let live_calls = routing.calls();
        assert_eq!(live_calls, 4);

        let second = pipeline(routing.clone(), RetryPolicy::none()).with_cache(cache);
        let accepted = second
            .filter(listings, constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();

        assert_eq!(ids(&accepted), [1].into_iter().collect());
        assert_eq!(routing.calls(), live_calls);
        assert_eq!(second.stats().cache_hits.load(Ordering::Relaxed), 4);
        assert_eq!(second.stats().live_lookups.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_rejects_only_that_listing() {
        init_tracing();
        let Scenario { routing, listings } = scenario();
        let broken = listings[0].clone();
        let mut healthy = listing(5, 1200.0);
        healthy.location = Coordinate::new(51.49, -0.15);
        route(&routing, &healthy, office(), 20);
        route(&routing, &healthy, gym(), 25);
        routing.fail_origin(
            broken.location,
            ApiError::ApiResponseError {
                status_code: 503,
                message: "Service temporarily unavailable".into(),
            },
        );
        let cache = Arc::new(JourneyCache::open(MemoryStore::new(), false).unwrap());
        let retry = RetryPolicy::new(RetryConfig::default(), QuotaRetryConfig::default());
        let pipeline = pipeline(routing.clone(), retry).with_cache(cache.clone());

        let accepted = pipeline
            .filter(vec![broken.clone(), healthy], constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();

        assert_eq!(ids(&accepted), [5].into_iter().collect());
        // Retried, then given up without caching the failure
        assert_eq!(routing.calls_from(broken.location), 3);
        assert!(!cache.contains(broken.location, office()));
        assert_eq!(pipeline.stats().failed_lookups.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().rejected_for("lookup_failed"), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_cached_as_no_journey() {
        let routing = Arc::new(MockRoutingServer::new());
        let lonely = listing(9, 1000.0);
        let cache = Arc::new(JourneyCache::open(MemoryStore::new(), false).unwrap());
        let pipeline = pipeline(routing.clone(), RetryPolicy::none()).with_cache(cache.clone());

        let accepted = pipeline
            .filter(vec![lonely.clone()], constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();

        assert!(accepted.is_empty());
        assert_eq!(cache.get(lonely.location, office()), Some(vec![]));
        assert_eq!(pipeline.stats().rejected_for("no_journey"), 1);
    }

    #[tokio::test]
    async fn test_cache_write_failure_does_not_stop_run() {
        init_tracing();
        let Scenario { routing, listings } = scenario();
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let cache = Arc::new(JourneyCache::open(store.clone(), false).unwrap());
        let pipeline = pipeline(routing.clone(), RetryPolicy::none()).with_cache(cache.clone());

        let accepted = pipeline
            .filter(listings, constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();

        assert_eq!(ids(&accepted), [1].into_iter().collect());
        assert_eq!(pipeline.state(), PipelineState::Completed);
        // Every write was rolled back, lookups still went out live
        assert!(cache.is_empty());
        assert!(store.snapshot().is_empty());
        assert_eq!(pipeline.stats().live_lookups.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_invalid_arrival_hour_rejected_before_start() {
        let routing = Arc::new(MockRoutingServer::new());
        let pipeline = FilterPipeline::new(
            routing.clone(),
            Arc::new(RateLimiter::new(500, Duration::from_secs(60))),
            RetryPolicy::none(),
            PipelineConfig {
                arrival_hour: 24,
                ..Default::default()
            },
        );

        let result = pipeline.filter(vec![listing(1, 1000.0)], constraints());

        assert!(matches!(result, Err(PipelineError::InvalidArrivalHour(24))));
        assert_eq!(pipeline.state(), PipelineState::Created);
        assert_eq!(routing.calls(), 0);
    }

    #[tokio::test]
    async fn test_seen_listings_skipped_without_lookups() {
        let Scenario { routing, listings } = scenario();
        let a_origin = listings[0].location;
        let seen = Arc::new(SeenLedger::in_memory([1]));
        let pipeline = pipeline(routing.clone(), RetryPolicy::none()).with_seen_ledger(seen);

        let accepted = pipeline
            .filter(listings, constraints())
            .unwrap()
            .collect_accepted()
            .await
            .unwrap();

        assert!(accepted.is_empty());
        assert_eq!(routing.calls_from(a_origin), 0);
        assert_eq!(pipeline.stats().skipped_seen.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().evaluated.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_malformed_frequency_surfaces_and_stops_run() {
        let mut odd = listing(1, 0.0);
        odd.price = Some(Price::new(900.0, "fortnightly"));
        let pipeline = pipeline(Arc::new(MockRoutingServer::new()), RetryPolicy::none());

        let items: Vec<RunItem> = pipeline.filter(vec![odd], constraints()).unwrap().collect().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(PipelineError::MalformedConstraint(ListingError::UnknownFrequency(_)))
        ));
        assert_eq!(pipeline.state(), PipelineState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_dispatch() {
        let routing = Arc::new(MockRoutingServer::new());
        routing.set_delay(1000);
        let listings: Vec<Listing> = (1..=10).map(|id| listing(id, 1000.0)).collect();
        for l in &listings {
            route(&routing, l, office(), 20);
            route(&routing, l, gym(), 20);
        }
        let pipeline = FilterPipeline::new(
            routing.clone(),
            Arc::new(RateLimiter::new(500, Duration::from_secs(60))),
            RetryPolicy::none(),
            PipelineConfig {
                workers: 1,
                ..Default::default()
            },
        )
        .with_arrival(arrival());

        let mut run = pipeline.filter(listings, constraints()).unwrap();
        let first = run.next().await.unwrap().unwrap();
        run.cancel();
        let rest: Vec<RunItem> = (&mut run).collect().await;

        assert_eq!(first.id, 1);
        assert!(rest.len() <= 1);
        assert!(routing.calls() <= 4, "{} routing calls", routing.calls());
        assert_eq!(pipeline.state(), PipelineState::Cancelled);
    }

    #[tokio::test]
    async fn test_pipeline_cannot_restart() {
        let Scenario { routing, listings } = scenario();
        let pipeline = pipeline(routing, RetryPolicy::none());

        let run = pipeline.filter(listings.clone(), constraints()).unwrap();
        run.collect_accepted().await.unwrap();

        assert!(matches!(
            pipeline.filter(listings, constraints()),
            Err(PipelineError::AlreadyStarted(PipelineState::Completed))
        ));
    }
}

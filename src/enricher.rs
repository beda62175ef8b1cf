//! Aircraft metadata enrichment with caching and failure backoff.
//!
//! [`Enricher::resolve`] never fails: when nothing can be learned (service
//! down, aircraft unknown, lookups disabled) it returns empty [`Metadata`].
//! Failures are remembered per hex, and network-level failures also trip a
//! host-wide backoff so an outage does not turn into one request per aircraft.
//! With an [`AircraftDb`] attached, successful lookups are remembered across
//! restarts and warm the cache at start-up.

use crate::aircraft_db::{AircraftDb, AircraftDbError};
use crate::backoff::RetryPolicy;
use crate::cache::MetadataCache;
use crate::client::{ClientError, MetadataFetch};
use crate::clock::{add_duration, Clock, SharedClock};
use crate::metadata::{self, MetadataSource};
use crate::operators::OperatorDirectory;
use crate::types::Metadata;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the enricher.
#[derive(Debug, Clone)]
pub struct EnricherConfig {
    /// Lookup URL templates, in priority order
    pub sources: Vec<MetadataSource>,
    /// Set to false to never issue lookups
    pub enabled: bool,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// First backoff after a timeout
    pub timeout_backoff: Duration,
    /// First backoff after any other failure
    pub error_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            sources: metadata::default_sources(),
            enabled: true,
            cache_ttl: Duration::from_secs(24 * 3600),
            cache_max_entries: 10_000,
            timeout_backoff: Duration::from_secs(30),
            error_backoff: Duration::from_secs(120),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

/// Backoff state after failed lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureBackoff {
    pub backoff: Duration,
    pub next_retry: DateTime<Utc>,
    pub last_error: DateTime<Utc>,
}

impl FailureBackoff {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.next_retry
    }
}

#[derive(Debug, Default)]
pub struct EnricherStats {
    pub lookups: AtomicU64,
    pub cache_hits: AtomicU64,
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    pub short_circuits: AtomicU64,
}

/// Why a whole lookup round failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    /// Service answered but had nothing usable.
    Miss,
    /// Network or service trouble; timeouts included.
    HostLevel {
        timeout: bool,
        /// Longest delay a rate-limited service asked for
        retry_after: Option<Duration>,
    },
}

pub struct Enricher {
    fetcher: Arc<dyn MetadataFetch>,
    directory: Arc<OperatorDirectory>,
    clock: SharedClock,
    config: EnricherConfig,
    cache: MetadataCache,
    hex_backoff: Mutex<HashMap<String, FailureBackoff>>,
    host_backoff: Mutex<Option<FailureBackoff>>,
    store: Option<Arc<AircraftDb>>,
    stats: EnricherStats,
}

impl Enricher {
    pub fn new(
        fetcher: Arc<dyn MetadataFetch>,
        directory: Arc<OperatorDirectory>,
        clock: SharedClock,
        config: EnricherConfig,
    ) -> Self {
        let cache = MetadataCache::new(config.cache_ttl, config.cache_max_entries);
        Self {
            fetcher,
            directory,
            clock,
            config,
            cache,
            hex_backoff: Mutex::new(HashMap::new()),
            host_backoff: Mutex::new(None),
            store: None,
            stats: EnricherStats::default(),
        }
    }

    /// Attach a persistent database and warm the cache from it. Entries keep
    /// their stored timestamps, so ones older than the TTL stay cold.
    pub fn with_store(mut self, store: Arc<AircraftDb>) -> Self {
        let now = self.clock.now();
        for (hex, meta, seen) in store.snapshot() {
            if seen <= now {
                self.cache.put(&hex, meta, seen);
            }
        }
        self.cache.evict(now);
        tracing::info!(
            "Warmed metadata cache with {} of {} stored aircraft",
            self.cache.len(),
            store.len()
        );
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&Arc<AircraftDb>> {
        self.store.as_ref()
    }

    /// Save the attached database if it changed.
    pub fn persist(&self) -> Result<bool, AircraftDbError> {
        match &self.store {
            Some(store) => store.save(),
            None => Ok(false),
        }
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn stats(&self) -> &EnricherStats {
        &self.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.sources.is_empty()
    }

    /// Operator name for a live callsign, from the prefix table.
    pub fn operator_for_callsign(&self, callsign: &str) -> Option<String> {
        self.directory.lookup(callsign)
    }

    pub fn hex_backoff(&self, hex: &str) -> Option<FailureBackoff> {
        self.hex_backoff.lock().get(&key(hex)).cloned()
    }

    pub fn host_backoff(&self) -> Option<FailureBackoff> {
        self.host_backoff.lock().clone()
    }

    /// Resolve metadata for `hex`.
    pub async fn resolve(&self, hex: &str) -> Metadata {
        let hex = key(hex);
        if hex.is_empty() || !self.is_enabled() {
            return Metadata::default();
        }

        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();

        if let Some(meta) = self.cache.get(&hex, now) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return meta;
        }

        if self.host_backoff.lock().as_ref().is_some_and(|b| b.is_active(now)) {
            self.stats.short_circuits.fetch_add(1, Ordering::Relaxed);
            return Metadata::default();
        }

        if self
            .hex_backoff
            .lock()
            .get(&hex)
            .is_some_and(|b| b.is_active(now))
        {
            self.stats.short_circuits.fetch_add(1, Ordering::Relaxed);
            return Metadata::default();
        }

        match self.lookup(&hex).await {
            Ok(meta) => {
                let now = self.clock.now();
                self.cache.put(&hex, meta.clone(), now);
                if let Some(store) = &self.store {
                    store.record(&hex, &meta, now);
                }
                self.hex_backoff.lock().remove(&hex);
                self.host_backoff.lock().take();
                meta
            }
            Err(class) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.record_failure(&hex, class);
                Metadata::default()
            }
        }
    }

    /// Try each source once, in order.
    async fn lookup(&self, hex: &str) -> Result<Metadata, FailureClass> {
        let mut class = FailureClass::Miss;

        for source in &self.config.sources {
            let url = source.url_for(hex);
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            match self.fetcher.fetch_json(&url).await {
                Ok(body) => match metadata::extract(body, hex, &self.directory) {
                    Some(meta) => {
                        tracing::debug!("Resolved {} via {}: {:?}", hex, source.template(), meta);
                        return Ok(meta);
                    }
                    None => tracing::debug!("No usable metadata for {} at {}", hex, url),
                },
                Err(e) => {
                    class = merge_class(class, &e);
                    if e.is_host_level() {
                        tracing::warn!("Metadata lookup for {} failed at {}: {}", hex, url, e);
                    } else {
                        tracing::debug!("Metadata lookup for {} failed at {}: {}", hex, url, e);
                    }
                }
            }
        }

        Err(class)
    }

    fn record_failure(&self, hex: &str, class: FailureClass) {
        let now = self.clock.now();
        let (base, retry_after) = match class {
            FailureClass::HostLevel {
                timeout: true,
                retry_after,
            } => (self.config.timeout_backoff, retry_after),
            FailureClass::HostLevel { retry_after, .. } => (self.config.error_backoff, retry_after),
            FailureClass::Miss => (self.config.error_backoff, None),
        };
        let policy = RetryPolicy::new(base, self.config.max_backoff);

        let step = |previous: Option<&FailureBackoff>| {
            let backoff = policy.next_delay(previous.map(|b| b.backoff));
            FailureBackoff {
                backoff,
                next_retry: add_duration(now, backoff),
                last_error: now,
            }
        };

        {
            let mut map = self.hex_backoff.lock();
            let next = step(map.get(hex));
            tracing::debug!("Backing off lookups for {} for {:?}", hex, next.backoff);
            map.insert(hex.to_string(), next);
        }

        if matches!(class, FailureClass::HostLevel { .. }) {
            let mut host = self.host_backoff.lock();
            let mut next = step(host.as_ref());
            if let Some(wait) = retry_after {
                let wait = wait.min(self.config.max_backoff);
                if wait > next.backoff {
                    next.backoff = wait;
                    next.next_retry = add_duration(now, wait);
                }
            }
            tracing::warn!("Metadata service unavailable, pausing all lookups for {:?}", next.backoff);
            *host = Some(next);
        }
    }

    /// Drop expired cache entries and long-expired backoff entries.
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let removed = self.cache.evict(now);

        let max = self.config.max_backoff;
        self.hex_backoff
            .lock()
            .retain(|_, b| add_duration(b.next_retry, max) > now);

        removed
    }
}

fn key(hex: &str) -> String {
    hex.trim().to_ascii_lowercase()
}

fn merge_class(current: FailureClass, error: &ClientError) -> FailureClass {
    if !error.is_host_level() {
        return current;
    }
    let asked = match error {
        ClientError::RateLimited { retry_after } => *retry_after,
        _ => None,
    };
    match current {
        FailureClass::HostLevel {
            timeout,
            retry_after,
        } => FailureClass::HostLevel {
            timeout: timeout || error.is_timeout(),
            retry_after: retry_after.max(asked),
        },
        FailureClass::Miss => FailureClass::HostLevel {
            timeout: error.is_timeout(),
            retry_after: asked,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    /// Fetcher that replays canned results and counts calls.
    pub(crate) struct StubFetcher {
        responses: Mutex<VecDeque<Result<Value, ClientError>>>,
        fallback: Box<dyn Fn() -> Result<Value, ClientError> + Send + Sync>,
        pub calls: AtomicU64,
        pub urls: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        pub(crate) fn always(f: impl Fn() -> Result<Value, ClientError> + Send + Sync + 'static) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: Box::new(f),
                calls: AtomicU64::new(0),
                urls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn queue(self, result: Result<Value, ClientError>) -> Self {
            self.responses.lock().push_back(result);
            self
        }

        pub(crate) fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataFetch for StubFetcher {
        async fn fetch_json(&self, url: &str) -> Result<Value, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(url.to_string());
            let next = self.responses.lock().pop_front();
            next.unwrap_or_else(|| (self.fallback)())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn single_source() -> EnricherConfig {
        EnricherConfig {
            sources: vec![MetadataSource::new("http://meta/{hex}")],
            ..Default::default()
        }
    }

    fn enricher(stub: Arc<StubFetcher>, clock: &ManualClock, config: EnricherConfig) -> Enricher {
        Enricher::new(
            stub,
            Arc::new(OperatorDirectory::builtin()),
            Arc::new(clock.clone()),
            config,
        )
    }

    fn unavailable() -> Result<Value, ClientError> {
        Err(ClientError::ServerError {
            status: StatusCode::SERVICE_UNAVAILABLE,
        })
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        let stub = Arc::new(StubFetcher::always(|| Ok(json!({"registration": "N1"}))));
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub.clone(), &clock, single_source());

        let first = enricher.resolve("AB0001").await;
        let second = enricher.resolve("ab0001").await;

        assert_eq!(stub.calls(), 1);
        assert_eq!(first.registration, "N1");
        assert_eq!(first, second);
        assert_eq!(stub.urls.lock()[0], "http://meta/ab0001");
    }

    #[tokio::test]
    async fn test_ttl_expiry_refetches() {
        let stub = Arc::new(StubFetcher::always(|| Ok(json!({"registration": "N1"}))));
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub.clone(), &clock, single_source());

        enricher.resolve("ab0001").await;
        clock.advance(Duration::from_secs(24 * 3600 + 1));
        enricher.resolve("ab0001").await;

        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_sources_tried_in_order() {
        let stub = Arc::new(
            StubFetcher::always(|| Ok(json!({"registration": "SECOND"})))
                .queue(Err(ClientError::NotFound)),
        );
        let clock = ManualClock::new(t0());
        let config = EnricherConfig {
            sources: vec![
                MetadataSource::new("http://first/{hex}"),
                MetadataSource::new("http://second/{hex_upper}"),
            ],
            ..Default::default()
        };
        let enricher = enricher(stub.clone(), &clock, config);

        let meta = enricher.resolve("abc123").await;
        assert_eq!(meta.registration, "SECOND");
        assert_eq!(
            *stub.urls.lock(),
            vec!["http://first/abc123".to_string(), "http://second/ABC123".to_string()]
        );
    }

    #[tokio::test]
    async fn test_repeated_503_short_circuits() {
        let stub = Arc::new(StubFetcher::always(unavailable));
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub.clone(), &clock, single_source());

        for _ in 0..3 {
            let meta = enricher.resolve("dead01").await;
            assert!(meta.is_empty());
        }

        assert_eq!(stub.calls(), 1);
        assert!(enricher.host_backoff().is_some());
        assert_eq!(enricher.stats().short_circuits.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let stub = Arc::new(StubFetcher::always(|| Err(ClientError::NotFound)));
        let clock = ManualClock::new(t0());
        let config = EnricherConfig {
            max_backoff: Duration::from_secs(300),
            ..single_source()
        };
        let enricher = enricher(stub.clone(), &clock, config);

        let mut previous = Duration::ZERO;
        for _ in 0..5 {
            enricher.resolve("beef01").await;
            let entry = enricher.hex_backoff("BEEF01").unwrap();
            assert!(entry.backoff >= previous);
            assert!(entry.backoff <= Duration::from_secs(300));
            previous = entry.backoff;
            clock.set(entry.next_retry);
        }

        assert_eq!(previous, Duration::from_secs(300));
        assert_eq!(stub.calls(), 5);
        // a clean 404 is not a host problem
        assert!(enricher.host_backoff().is_none());
    }

    #[tokio::test]
    async fn test_timeouts_back_off_less_than_errors() {
        let clock = ManualClock::new(t0());

        let timeouts = Arc::new(StubFetcher::always(|| Err(ClientError::Timeout)));
        let e1 = enricher(timeouts, &clock, single_source());
        e1.resolve("aa0001").await;

        let errors = Arc::new(StubFetcher::always(|| Err(ClientError::Connect("refused".into()))));
        let e2 = enricher(errors, &clock, single_source());
        e2.resolve("aa0001").await;

        let t = e1.hex_backoff("aa0001").unwrap().backoff;
        let c = e2.hex_backoff("aa0001").unwrap().backoff;
        assert!(t < c);
        assert!(e1.host_backoff().is_some());
        assert!(e2.host_backoff().is_some());
    }

    #[tokio::test]
    async fn test_host_backoff_blocks_other_hexes_then_clears() {
        let stub = Arc::new(
            StubFetcher::always(|| Ok(json!({"registration": "N2"}))).queue(Err(ClientError::Timeout)),
        );
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub.clone(), &clock, single_source());

        assert!(enricher.resolve("aa0001").await.is_empty());
        assert!(enricher.resolve("bb0002").await.is_empty());
        assert_eq!(stub.calls(), 1);

        clock.advance(Duration::from_secs(31));
        assert_eq!(enricher.resolve("bb0002").await.registration, "N2");
        assert!(enricher.host_backoff().is_none());
        assert!(enricher.hex_backoff("bb0002").is_none());
    }

    #[tokio::test]
    async fn test_disabled_never_fetches() {
        let stub = Arc::new(StubFetcher::always(|| Ok(json!({"registration": "N1"}))));
        let clock = ManualClock::new(t0());
        let config = EnricherConfig {
            enabled: false,
            ..single_source()
        };
        let enricher = enricher(stub.clone(), &clock, config);

        assert!(enricher.resolve("ab0001").await.is_empty());
        assert_eq!(stub.calls(), 0);
        assert!(enricher.hex_backoff("ab0001").is_none());
    }

    #[tokio::test]
    async fn test_evict_drops_stale_backoff() {
        let stub = Arc::new(StubFetcher::always(|| Err(ClientError::NotFound)));
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub, &clock, single_source());

        enricher.resolve("cafe01").await;
        enricher.evict(clock.now());
        assert!(enricher.hex_backoff("cafe01").is_some());

        clock.advance(Duration::from_secs(2 * 3600));
        enricher.evict(clock.now());
        assert!(enricher.hex_backoff("cafe01").is_none());
    }

    #[tokio::test]
    async fn test_retry_after_extends_host_pause() {
        let stub = Arc::new(
            StubFetcher::always(|| Ok(json!({"registration": "N3"}))).queue(Err(
                ClientError::RateLimited {
                    retry_after: Some(Duration::from_secs(900)),
                },
            )),
        );
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub.clone(), &clock, single_source());

        assert!(enricher.resolve("aa0009").await.is_empty());
        let host = enricher.host_backoff().unwrap();
        assert_eq!(host.backoff, Duration::from_secs(900));

        // the regular 120 s backoff would have expired by now
        clock.advance(Duration::from_secs(600));
        assert!(enricher.resolve("bb0009").await.is_empty());
        assert_eq!(stub.calls(), 1);

        clock.advance(Duration::from_secs(301));
        assert_eq!(enricher.resolve("bb0009").await.registration, "N3");
    }

    #[tokio::test]
    async fn test_retry_after_is_capped() {
        let stub = Arc::new(StubFetcher::always(|| {
            Err(ClientError::RateLimited {
                retry_after: Some(Duration::from_secs(86_400)),
            })
        }));
        let clock = ManualClock::new(t0());
        let enricher = enricher(stub, &clock, single_source());

        enricher.resolve("aa0010").await;
        assert_eq!(enricher.host_backoff().unwrap().backoff, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_store_records_lookups_and_warms_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aircraft_db.json");
        let clock = ManualClock::new(t0());

        let stub = Arc::new(
            StubFetcher::always(|| Err(ClientError::NotFound))
                .queue(Ok(json!({"registration": "N77", "model": "A320"}))),
        );
        let first = enricher(stub, &clock, single_source())
            .with_store(Arc::new(AircraftDb::open(&path)));
        assert_eq!(first.resolve("ab0077").await.registration, "N77");
        assert!(first.resolve("ab0078").await.is_empty());
        assert!(first.persist().unwrap());
        assert_eq!(first.store().unwrap().len(), 1);

        // restart an hour later: served from the warmed cache, no request
        clock.advance(Duration::from_secs(3600));
        let stub = Arc::new(StubFetcher::always(unavailable));
        let second = enricher(stub.clone(), &clock, single_source())
            .with_store(Arc::new(AircraftDb::open(&path)));
        assert_eq!(second.cache().len(), 1);
        let meta = second.resolve("AB0077").await;
        assert_eq!(meta.model, "A320");
        assert_eq!(stub.calls(), 0);

        // failures still resolve to empty metadata
        assert!(second.resolve("ab0078").await.is_empty());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_store_entries_stay_cold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aircraft_db.json");
        let db = AircraftDb::open(&path);
        db.record("ab0079", &Metadata::new("N79", "", "", ""), t0());
        db.save().unwrap();

        let clock = ManualClock::new(t0() + chrono::Duration::days(2));
        let stub = Arc::new(StubFetcher::always(|| Ok(json!({"registration": "N79-NEW"}))));
        let enricher = enricher(stub.clone(), &clock, single_source())
            .with_store(Arc::new(AircraftDb::open(&path)));

        assert!(enricher.cache().is_empty());
        assert_eq!(enricher.resolve("ab0079").await.registration, "N79-NEW");
        assert_eq!(stub.calls(), 1);
    }
}

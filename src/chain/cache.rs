//! Per-chain cache of the current block hash.
//!
//! Reads never block on the network: a missing or expired record schedules
//! a background refresh and the best value currently held is returned.
//! At most one refresh per chain is in flight; a request for a chain that is
//! already refreshing is satisfied by the running attempt.

use crate::chain::endpoints::{build_endpoint, validate_tip, ChainEndpoint};
use crate::config::{positive_secs, ChainConfig};
use crate::models::{ChainRecord, HashCheck};
use crate::time::sources::{http_client, unix_now, unix_seconds};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings for a [`ChainHashCache`].
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// How long a retrieved hash stays fresh.
    pub ttl: Duration,
    /// Timeout applied to each endpoint request.
    pub request_timeout: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ChainConfig> for ChainSettings {
    fn from(config: &ChainConfig) -> Self {
        let defaults = Self::default();
        Self {
            ttl: if config.cache_duration_secs > 0 {
                Duration::from_secs(config.cache_duration_secs)
            } else {
                defaults.ttl
            },
            request_timeout: positive_secs(config.timeout_secs).unwrap_or(defaults.request_timeout),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Refresh requests absorbed by an attempt already in flight.
    pub coalesced_requests: u64,
    pub success_rate: f64,
    pub cached_chains: Vec<String>,
    /// Unix seconds of the last successful refresh per chain.
    pub last_updates: BTreeMap<String, f64>,
}

#[derive(Default)]
struct ChainState {
    records: HashMap<String, ChainRecord>,
    in_flight: HashSet<String>,
    last_updates: BTreeMap<String, f64>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    coalesced: u64,
}

struct CacheInner {
    enabled: Vec<String>,
    endpoints: HashMap<String, Vec<Arc<dyn ChainEndpoint>>>,
    settings: ChainSettings,
    state: Mutex<ChainState>,
    counters: Mutex<Counters>,
}

/// Marks a chain as refreshing; the mark is cleared when dropped.
struct InFlight {
    inner: Arc<CacheInner>,
    chain: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.state.lock().in_flight.remove(&self.chain);
    }
}

impl CacheInner {
    fn try_claim(self: &Arc<Self>, chain: &str) -> Option<InFlight> {
        let mut state = self.state.lock();
        if !state.in_flight.insert(chain.to_string()) {
            drop(state);
            self.counters.lock().coalesced += 1;
            debug!("Refresh for {} already in flight", chain);
            return None;
        }
        Some(InFlight {
            inner: Arc::clone(self),
            chain: chain.to_string(),
        })
    }

    /// Try each endpoint in priority order and store the first valid tip.
    async fn refresh(&self, claim: InFlight) -> bool {
        let chain = claim.chain.as_str();
        self.counters.lock().total += 1;

        let Some(endpoints) = self.endpoints.get(chain).filter(|e| !e.is_empty()) else {
            warn!("No endpoints configured for chain {}", chain);
            self.counters.lock().failed += 1;
            return false;
        };

        let timeout = self.settings.request_timeout;
        for endpoint in endpoints {
            let result = match tokio::time::timeout(timeout, endpoint.fetch_tip()).await {
                Ok(result) => result.and_then(validate_tip),
                Err(_) => Err(crate::error::SourceError::Timeout(timeout.as_secs_f64())),
            };

            match result {
                Ok(tip) => {
                    let mut state = self.state.lock();
                    let now = Utc::now();
                    let retrieved_at = match state.records.get(chain) {
                        Some(prev) if prev.retrieved_at >= now => {
                            prev.retrieved_at + ChronoDuration::microseconds(1)
                        }
                        _ => now,
                    };
                    let ttl = ChronoDuration::from_std(self.settings.ttl)
                        .unwrap_or_else(|_| ChronoDuration::seconds(300));

                    debug!(
                        "{} tip from {}: height {} hash {}",
                        chain,
                        endpoint.name(),
                        tip.height,
                        tip.hash
                    );
                    state.records.insert(
                        chain.to_string(),
                        ChainRecord {
                            chain_id: chain.to_string(),
                            block_height: tip.height,
                            block_hash: tip.hash,
                            observed_at: tip.observed_at,
                            retrieved_at,
                            ttl_expiry: retrieved_at + ttl,
                        },
                    );
                    state.last_updates.insert(chain.to_string(), unix_seconds(&retrieved_at));
                    drop(state);

                    self.counters.lock().successful += 1;
                    return true;
                }
                Err(e) => {
                    debug!("{} endpoint {} failed: {}", chain, endpoint.name(), e);
                }
            }
        }

        self.counters.lock().failed += 1;
        warn!(
            "All {} endpoints for {} failed, keeping cached value",
            endpoints.len(),
            chain
        );
        false
    }
}

/// Cache of current block hashes for the enabled chains.
#[derive(Clone)]
pub struct ChainHashCache {
    inner: Arc<CacheInner>,
}

impl ChainHashCache {
    /// Create a cache over explicit endpoints.
    pub fn new(
        enabled: Vec<String>,
        endpoints: HashMap<String, Vec<Arc<dyn ChainEndpoint>>>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                enabled,
                endpoints,
                settings,
                state: Mutex::new(ChainState::default()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Create a cache from configuration, using the built-in endpoint table
    /// for chains without explicit endpoints.
    pub fn from_config(config: &ChainConfig) -> Self {
        let settings = ChainSettings::from(config);
        let client = http_client(settings.request_timeout);

        let endpoints = config
            .enabled
            .iter()
            .map(|chain| {
                let list = config
                    .endpoints_for(chain)
                    .iter()
                    .map(|spec| build_endpoint(spec, &client))
                    .collect::<Vec<_>>();
                if list.is_empty() {
                    warn!("Chain {} has no known endpoints", chain);
                }
                (chain.clone(), list)
            })
            .collect();

        info!("Chain cache enabled for: {}", config.enabled.join(", "));
        Self::new(config.enabled.clone(), endpoints, settings)
    }

    pub fn enabled_chains(&self) -> &[String] {
        &self.inner.enabled
    }

    fn needs_refresh(record: Option<&ChainRecord>, now: DateTime<Utc>) -> bool {
        record.map_or(true, |r| r.is_expired(now))
    }

    /// Current hash per enabled chain, scheduling refreshes for stale ones.
    ///
    /// Chains with no record yet are absent; expired records are returned as-is.
    pub fn get_hashes(&self) -> BTreeMap<String, String> {
        let now = Utc::now();
        let mut hashes = BTreeMap::new();
        let mut stale = Vec::new();

        {
            let state = self.inner.state.lock();
            for chain in &self.inner.enabled {
                let record = state.records.get(chain);
                if let Some(record) = record {
                    hashes.insert(chain.clone(), record.block_hash.clone());
                }
                if Self::needs_refresh(record, now) {
                    stale.push(chain.clone());
                }
            }
        }

        for chain in stale {
            self.request_refresh(&chain);
        }

        hashes
    }

    /// Schedule a background refresh of `chain` unless one is already running.
    ///
    /// Returns true when a new refresh was started.
    pub fn request_refresh(&self, chain: &str) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, not refreshing {}", chain);
            return false;
        };
        let Some(claim) = self.inner.try_claim(chain) else {
            return false;
        };

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            inner.refresh(claim).await;
        });
        true
    }

    /// Full record for `chain`, if one has ever been retrieved.
    pub fn get_info(&self, chain: &str) -> Option<ChainRecord> {
        self.inner.state.lock().records.get(chain).cloned()
    }

    /// Records of all enabled chains currently cached.
    pub fn get_all_info(&self) -> BTreeMap<String, ChainRecord> {
        let state = self.inner.state.lock();
        self.inner
            .enabled
            .iter()
            .filter_map(|chain| state.records.get(chain).map(|r| (chain.clone(), r.clone())))
            .collect()
    }

    /// Refresh one chain, or every enabled chain, ignoring freshness.
    ///
    /// Returns true iff at least one chain was refreshed by this call. A chain
    /// whose refresh is already in flight is left to that attempt and does
    /// not count as refreshed here.
    pub async fn force_update(&self, chain: Option<&str>) -> bool {
        let chains: Vec<String> = match chain {
            Some(chain) => vec![chain.to_string()],
            None => self.inner.enabled.clone(),
        };

        let attempts = chains.iter().filter_map(|chain| self.inner.try_claim(chain)).map(|claim| {
            let inner = Arc::clone(&self.inner);
            async move { inner.refresh(claim).await }
        });

        futures::future::join_all(attempts)
            .await
            .into_iter()
            .any(|refreshed| refreshed)
    }

    /// Exact comparison of `hash` with the cached hash for `chain`.
    ///
    /// This does not validate the hash against the ledger; it only tells
    /// whether it equals the most recently cached tip.
    pub fn verify_hash(&self, chain: &str, hash: &str) -> HashCheck {
        match self.get_info(chain) {
            Some(record) => HashCheck {
                valid: record.block_hash == hash,
                chain: chain.to_string(),
                given_hash: hash.to_string(),
                current_hash: Some(record.block_hash.clone()),
                current_height: Some(record.block_height),
                block_age_seconds: Some(unix_now() - unix_seconds(&record.retrieved_at)),
                error: None,
            },
            None => HashCheck {
                valid: false,
                chain: chain.to_string(),
                given_hash: hash.to_string(),
                current_hash: None,
                current_height: None,
                block_age_seconds: None,
                error: Some(format!("No current data for {}", chain)),
            },
        }
    }

    pub fn statistics(&self) -> ChainStats {
        let counters = self.inner.counters.lock();
        let state = self.inner.state.lock();

        let mut cached_chains: Vec<String> = state.records.keys().cloned().collect();
        cached_chains.sort();

        ChainStats {
            total_requests: counters.total,
            successful_requests: counters.successful,
            failed_requests: counters.failed,
            coalesced_requests: counters.coalesced,
            success_rate: counters.successful as f64 / counters.total.max(1) as f64,
            cached_chains,
            last_updates: state.last_updates.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::endpoints::{BlockCypherEndpoint, EsploraEndpoint, TipObservation};
    use crate::error::SourceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn hash_for(height: u64) -> String {
        format!("{:064x}", height)
    }

    /// Endpoint returning an increasing height on every call.
    struct FakeEndpoint {
        name: String,
        height: AtomicU64,
        delay: Duration,
        mode: Mutex<Mode>,
        calls: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum Mode {
        Ok,
        Fail,
        Garbage,
    }

    impl FakeEndpoint {
        fn new(name: &str, mode: Mode) -> Arc<Self> {
            Self::with_delay(name, mode, Duration::ZERO)
        }

        fn with_delay(name: &str, mode: Mode, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                height: AtomicU64::new(100),
                delay,
                mode: Mutex::new(mode),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock() = mode;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainEndpoint for FakeEndpoint {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch_tip(&self) -> Result<TipObservation, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mode = *self.mode.lock();
            match mode {
                Mode::Ok => {
                    let height = self.height.fetch_add(1, Ordering::SeqCst);
                    Ok(TipObservation {
                        height,
                        hash: hash_for(height),
                        observed_at: None,
                    })
                }
                Mode::Fail => Err(SourceError::Transport("connection refused".to_string())),
                Mode::Garbage => Ok(TipObservation {
                    height: 5,
                    hash: "not-a-hash".to_string(),
                    observed_at: None,
                }),
            }
        }
    }

    fn cache_with(chain: &str, endpoints: Vec<Arc<dyn ChainEndpoint>>, ttl: Duration) -> ChainHashCache {
        let mut map = HashMap::new();
        map.insert(chain.to_string(), endpoints);
        ChainHashCache::new(
            vec![chain.to_string()],
            map,
            ChainSettings {
                ttl,
                request_timeout: Duration::from_millis(500),
            },
        )
    }

    #[tokio::test]
    async fn test_falls_back_through_endpoints() {
        let down = FakeEndpoint::new("down", Mode::Fail);
        let garbage = FakeEndpoint::new("garbage", Mode::Garbage);
        let good = FakeEndpoint::new("good", Mode::Ok);
        let cache = cache_with(
            "bitcoin",
            vec![down.clone(), garbage.clone(), good.clone()],
            Duration::from_secs(300),
        );

        assert!(cache.force_update(Some("bitcoin")).await);
        assert_eq!((down.calls(), garbage.calls(), good.calls()), (1, 1, 1));

        let record = cache.get_info("bitcoin").unwrap();
        assert_eq!(record.block_height, 100);
        assert_eq!(record.block_hash, hash_for(100));
        assert!(record.ttl_expiry > record.retrieved_at);
    }

    #[tokio::test]
    async fn test_first_valid_endpoint_wins() {
        let first = FakeEndpoint::new("first", Mode::Ok);
        let second = FakeEndpoint::new("second", Mode::Ok);
        let cache = cache_with("bitcoin", vec![first.clone(), second.clone()], Duration::from_secs(300));

        assert!(cache.force_update(None).await);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_record() {
        let endpoint = FakeEndpoint::new("only", Mode::Ok);
        let cache = cache_with("bitcoin", vec![endpoint.clone()], Duration::from_secs(300));

        assert!(cache.force_update(Some("bitcoin")).await);
        let before = cache.get_info("bitcoin").unwrap();

        endpoint.set_mode(Mode::Fail);
        assert!(!cache.force_update(Some("bitcoin")).await);
        assert_eq!(cache.get_info("bitcoin").unwrap(), before);

        let stats = cache.statistics();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.cached_chains, vec!["bitcoin"]);
    }

    #[tokio::test]
    async fn test_retrieved_at_strictly_increases() {
        let endpoint = FakeEndpoint::new("only", Mode::Ok);
        let cache = cache_with("bitcoin", vec![endpoint], Duration::from_secs(300));

        let mut last: Option<DateTime<Utc>> = None;
        for _ in 0..5 {
            assert!(cache.force_update(Some("bitcoin")).await);
            let at = cache.get_info("bitcoin").unwrap().retrieved_at;
            if let Some(prev) = last {
                assert!(at > prev);
            }
            last = Some(at);
        }
    }

    #[tokio::test]
    async fn test_concurrent_reads_start_one_refresh() {
        let endpoint = FakeEndpoint::with_delay("slow", Mode::Ok, Duration::from_millis(100));
        let cache = cache_with("bitcoin", vec![endpoint.clone()], Duration::from_secs(300));

        let a = cache.clone();
        let b = cache.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.get_hashes() }),
            tokio::spawn(async move { b.get_hashes() })
        );
        // Nothing cached yet, and neither call waited for the network
        assert!(first.unwrap().is_empty());
        assert!(second.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(cache.get_hashes().get("bitcoin"), Some(&hash_for(100)));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_value_returned_while_refreshing() {
        let endpoint = FakeEndpoint::with_delay("slow", Mode::Ok, Duration::from_millis(100));
        let cache = cache_with("bitcoin", vec![endpoint.clone()], Duration::from_millis(1));

        assert!(cache.force_update(Some("bitcoin")).await);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Expired: old hash returned immediately, refresh scheduled
        let hashes = cache.get_hashes();
        assert_eq!(hashes.get("bitcoin"), Some(&hash_for(100)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.get_info("bitcoin").unwrap().block_height, 101);
    }

    #[tokio::test]
    async fn test_force_update_while_in_flight_does_not_duplicate() {
        let endpoint = FakeEndpoint::with_delay("slow", Mode::Ok, Duration::from_millis(100));
        let cache = cache_with("bitcoin", vec![endpoint.clone()], Duration::from_secs(300));

        assert!(cache.request_refresh("bitcoin"));
        assert!(!cache.request_refresh("bitcoin"));
        assert!(!cache.force_update(Some("bitcoin")).await);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(endpoint.calls(), 1);
        assert!(cache.get_info("bitcoin").is_some());
        assert_eq!(cache.statistics().coalesced_requests, 2);
    }

    #[tokio::test]
    async fn test_unreachable_chain_stays_unavailable() {
        let client = reqwest::Client::new();
        let endpoints: Vec<Arc<dyn ChainEndpoint>> = vec![
            Arc::new(EsploraEndpoint::new("http://127.0.0.1:1/api", client.clone())),
            Arc::new(BlockCypherEndpoint::new("http://127.0.0.1:1/v1/btc/main", client)),
        ];
        let cache = cache_with("bitcoin", endpoints, Duration::from_secs(300));

        assert!(!cache.force_update(Some("bitcoin")).await);
        assert!(!cache.force_update(Some("bitcoin")).await);
        assert!(cache.get_info("bitcoin").is_none());
    }

    #[tokio::test]
    async fn test_endpoint_timeout_moves_to_next() {
        let hung = FakeEndpoint::with_delay("hung", Mode::Ok, Duration::from_secs(10));
        let good = FakeEndpoint::new("good", Mode::Ok);
        let cache = cache_with("bitcoin", vec![hung, good.clone()], Duration::from_secs(300));

        assert!(cache.force_update(Some("bitcoin")).await);
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn test_verify_hash_exact_match() {
        let cache = cache_with("bitcoin", vec![FakeEndpoint::new("e", Mode::Ok)], Duration::from_secs(300));

        let missing = cache.verify_hash("bitcoin", &hash_for(100));
        assert!(!missing.valid);
        assert!(missing.error.is_some());

        cache.force_update(None).await;
        assert!(cache.verify_hash("bitcoin", &hash_for(100)).valid);

        let wrong = cache.verify_hash("bitcoin", &hash_for(99));
        assert!(!wrong.valid);
        assert_eq!(wrong.current_height, Some(100));
    }

    #[tokio::test]
    async fn test_unknown_chain_fails_refresh() {
        let cache = ChainHashCache::new(vec!["dogecoin".to_string()], HashMap::new(), ChainSettings::default());
        assert!(!cache.force_update(None).await);
        assert!(cache.get_all_info().is_empty());
    }

    #[test]
    fn test_get_hashes_without_runtime() {
        let endpoint = FakeEndpoint::new("e", Mode::Ok);
        let cache = cache_with("bitcoin", vec![endpoint.clone()], Duration::from_secs(300));
        assert!(cache.get_hashes().is_empty());
        assert!(!cache.request_refresh("bitcoin"));
        assert_eq!(endpoint.calls(), 0);
        assert_eq!(cache.statistics().coalesced_requests, 0);
    }
}

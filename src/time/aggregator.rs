//! Consensus clock built from several time oracles.
//!
//! Each sync queries every source concurrently, each under its own timeout.
//! Successful offsets replace the consensus map; a round with no successes
//! keeps the previous map (stale-if-error). Only one sync runs at a time;
//! callers arriving while one is in progress return immediately.

use crate::config::{positive_secs, TimeConfig};
use crate::models::{format_timestamp, parse_timestamp, TimeVerification, TimestampCheck, TimestampSample};
use crate::time::sources::{http_client, unix_now, HttpTimeSource, NtpSource, TimeSource};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings for a [`TimeAggregator`].
#[derive(Debug, Clone)]
pub struct TimeSettings {
    /// Timeout applied to each source query independently.
    pub source_timeout: Duration,
    /// Consensus older than this is refreshed before building a snapshot.
    pub refresh_interval: Duration,
}

impl Default for TimeSettings {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

impl From<&TimeConfig> for TimeSettings {
    fn from(config: &TimeConfig) -> Self {
        let defaults = Self::default();
        Self {
            source_timeout: positive_secs(config.timeout_secs).unwrap_or(defaults.source_timeout),
            refresh_interval: positive_secs(config.refresh_interval_secs)
                .unwrap_or(defaults.refresh_interval),
        }
    }
}

/// Current consensus: successful offsets of the last good round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimeConsensus {
    pub offsets: BTreeMap<String, f64>,
    /// Unix seconds of the round that produced `offsets`.
    pub computed_at: Option<f64>,
}

/// Outcome of a call to [`TimeAggregator::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// At least one source answered; the consensus was replaced.
    Updated { succeeded: usize, failed: usize },
    /// Every source failed; the previous consensus was kept.
    AllFailed { failed: usize },
    /// Another sync was already running; nothing was done.
    AlreadyRunning,
}

/// Aggregator statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub last_sync_time: Option<f64>,
    pub active_sources: usize,
    pub offsets: BTreeMap<String, f64>,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
}

/// Median of a set of offsets. Empty input yields 0.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Readings further than this from the local clock are treated as failures.
pub const MAX_PLAUSIBLE_OFFSET: f64 = 86_400.0;

fn offset_duration(offset: f64) -> ChronoDuration {
    ChronoDuration::microseconds((offset * 1e6).round() as i64)
}

/// `base` shifted by `offset` seconds; `base` itself if that leaves chrono's range.
fn shifted(base: DateTime<Utc>, offset: f64) -> DateTime<Utc> {
    base.checked_add_signed(offset_duration(offset))
        .unwrap_or(base)
}

/// Clears the single-flight flag however the sync future ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Time source aggregator.
pub struct TimeAggregator {
    sources: Vec<Arc<dyn TimeSource>>,
    settings: TimeSettings,
    consensus: RwLock<TimeConsensus>,
    syncing: AtomicBool,
    last_samples: Mutex<Vec<TimestampSample>>,
    counters: Mutex<Counters>,
}

impl TimeAggregator {
    /// Create an aggregator over explicit sources.
    pub fn new(sources: Vec<Arc<dyn TimeSource>>, settings: TimeSettings) -> Self {
        Self {
            sources,
            settings,
            consensus: RwLock::new(TimeConsensus::default()),
            syncing: AtomicBool::new(false),
            last_samples: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Create an aggregator over the configured NTP servers and HTTP APIs.
    pub fn from_config(config: &TimeConfig) -> Self {
        let settings = TimeSettings::from(config);
        let client = http_client(settings.source_timeout);

        let mut sources: Vec<Arc<dyn TimeSource>> = Vec::new();
        for server in &config.ntp_servers {
            sources.push(Arc::new(NtpSource::new(server.clone())));
        }
        for url in &config.http_apis {
            sources.push(Arc::new(HttpTimeSource::new(url.clone(), client.clone())));
        }

        info!("Time aggregator configured with {} sources", sources.len());
        Self::new(sources, settings)
    }

    /// Query every source once and refresh the consensus.
    pub async fn sync(&self) -> SyncOutcome {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Time sync already in progress");
            return SyncOutcome::AlreadyRunning;
        }
        let _guard = SyncGuard(&self.syncing);

        let timeout = self.settings.source_timeout;
        let queries = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move {
                let id = source.id().to_string();
                match tokio::time::timeout(timeout, source.query()).await {
                    Ok(Ok(reading))
                        if !reading.offset.is_finite()
                            || reading.offset.abs() > MAX_PLAUSIBLE_OFFSET =>
                    {
                        TimestampSample::failed(
                            &id,
                            format!("implausible offset {:e}s", reading.offset),
                        )
                    }
                    Ok(Ok(reading)) => TimestampSample {
                        source_id: id,
                        success: true,
                        offset_seconds: reading.offset,
                        round_trip_delay: reading.delay,
                        stratum_or_rank: reading.stratum,
                        error: None,
                    },
                    Ok(Err(e)) => TimestampSample::failed(&id, e.to_string()),
                    Err(_) => TimestampSample::failed(
                        &id,
                        format!("timed out after {:.1}s", timeout.as_secs_f64()),
                    ),
                }
            }
        });
        let samples = join_all(queries).await;

        let offsets: BTreeMap<String, f64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| (s.source_id.clone(), s.offset_seconds))
            .collect();
        for sample in samples.iter().filter(|s| !s.success) {
            debug!(
                "Time source {} failed: {}",
                sample.source_id,
                sample.error.as_deref().unwrap_or("unknown error")
            );
        }

        let succeeded = offsets.len();
        let failed = samples.len() - succeeded;
        *self.last_samples.lock() = samples;

        let mut counters = self.counters.lock();
        counters.total += 1;

        if succeeded == 0 {
            counters.failed += 1;
            warn!(
                "All {} time sources failed, keeping previous consensus",
                failed
            );
            return SyncOutcome::AllFailed { failed };
        }

        counters.successful += 1;
        drop(counters);

        let mut consensus = self.consensus.write();
        consensus.offsets = offsets;
        consensus.computed_at = Some(unix_now());
        debug!(
            "Time consensus updated: {} sources, median offset {:.6}s",
            succeeded,
            median(&consensus.offsets.values().copied().collect::<Vec<_>>())
        );

        SyncOutcome::Updated { succeeded, failed }
    }

    /// Sync now; true iff this call produced a successful round.
    pub async fn force_sync(&self) -> bool {
        matches!(self.sync().await, SyncOutcome::Updated { .. })
    }

    /// Median offset of the current consensus, 0 when there is none.
    pub fn consensus_offset(&self) -> f64 {
        let consensus = self.consensus.read();
        median(&consensus.offsets.values().copied().collect::<Vec<_>>())
    }

    /// Local clock corrected by the consensus offset.
    pub fn current_time(&self) -> DateTime<Utc> {
        shifted(Utc::now(), self.consensus_offset())
    }

    /// Copy of the current consensus.
    pub fn consensus(&self) -> TimeConsensus {
        self.consensus.read().clone()
    }

    /// Samples of the most recent completed sync round.
    pub fn last_samples(&self) -> Vec<TimestampSample> {
        self.last_samples.lock().clone()
    }

    fn is_stale(&self) -> bool {
        match self.consensus.read().computed_at {
            Some(at) => unix_now() - at > self.settings.refresh_interval.as_secs_f64(),
            None => true,
        }
    }

    /// Per-source verification data, syncing first when the consensus is stale.
    pub async fn verification_snapshot(&self) -> BTreeMap<String, TimeVerification> {
        if self.is_stale() {
            self.sync().await;
        }

        let consensus = self.consensus.read();
        let now = Utc::now();
        let last_sync = consensus.computed_at.unwrap_or(0.0);

        consensus
            .offsets
            .iter()
            .map(|(source, offset)| {
                let derived = shifted(now, *offset);
                (
                    source.clone(),
                    TimeVerification {
                        timestamp: format_timestamp(&derived),
                        offset: *offset,
                        last_sync,
                    },
                )
            })
            .collect()
    }

    /// Check whether `timestamp` lies within `tolerance` seconds of consensus time.
    pub fn verify_timestamp(&self, timestamp: &str, tolerance: f64) -> TimestampCheck {
        let given = match parse_timestamp(timestamp) {
            Ok(given) => given,
            Err(e) => {
                return TimestampCheck {
                    valid: false,
                    difference: None,
                    tolerance,
                    current: None,
                    given: None,
                    error: Some(e),
                }
            }
        };

        let current = self.current_time();
        let difference = (current - given)
            .num_microseconds()
            .map(|us| (us as f64 / 1e6).abs())
            .unwrap_or(f64::INFINITY);

        TimestampCheck {
            valid: difference <= tolerance,
            difference: Some(difference),
            tolerance,
            current: Some(format_timestamp(&current)),
            given: Some(format_timestamp(&given)),
            error: None,
        }
    }

    pub fn statistics(&self) -> TimeStats {
        let counters = self.counters.lock();
        let consensus = self.consensus.read();

        TimeStats {
            total_syncs: counters.total,
            successful_syncs: counters.successful,
            failed_syncs: counters.failed,
            last_sync_time: consensus.computed_at,
            active_sources: consensus.offsets.len(),
            offsets: consensus.offsets.clone(),
            success_rate: counters.successful as f64 / counters.total.max(1) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::time::sources::TimeReading;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Source answering with a fixed offset after an optional delay.
    struct FakeSource {
        id: String,
        offset: f64,
        delay: Duration,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn ok(id: &str, offset: f64) -> Arc<Self> {
            Self::slow(id, offset, Duration::ZERO)
        }

        fn failing(id: &str) -> Arc<Self> {
            let source = Self::ok(id, 0.0);
            source.set_failing(true);
            source
        }

        fn slow(id: &str, offset: f64, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                offset,
                delay,
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TimeSource for FakeSource {
        fn id(&self) -> &str {
            &self.id
        }

        async fn query(&self) -> Result<TimeReading, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(SourceError::Transport("unreachable".to_string()));
            }
            Ok(TimeReading {
                offset: self.offset,
                delay: 0.01,
                stratum: 2,
            })
        }
    }

    fn aggregator(sources: Vec<Arc<dyn TimeSource>>) -> TimeAggregator {
        TimeAggregator::new(
            sources,
            TimeSettings {
                source_timeout: Duration::from_millis(200),
                refresh_interval: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[-2.0, -1.0, 0.0, 1.0, 2.0]), 0.0);
        assert_eq!(median(&[1.0, 2.0]), 1.5);
        assert_eq!(median(&[3.0, -1.0, 2.0]), 2.0);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_no_consensus_uses_local_clock() {
        let agg = aggregator(vec![]);
        assert_eq!(agg.consensus_offset(), 0.0);
        let diff = (agg.current_time() - Utc::now()).num_milliseconds().abs();
        assert!(diff < 100);
    }

    #[tokio::test]
    async fn test_one_timeout_one_success() {
        let agg = aggregator(vec![
            FakeSource::slow("slow", 9.0, Duration::from_secs(5)),
            FakeSource::ok("fast", 0.05),
        ]);

        let outcome = agg.sync().await;
        assert_eq!(
            outcome,
            SyncOutcome::Updated {
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(agg.consensus_offset(), 0.05);

        let expected = Utc::now() + ChronoDuration::milliseconds(50);
        let diff = (agg.current_time() - expected).num_milliseconds().abs();
        assert!(diff < 100, "difference was {}ms", diff);

        let samples = agg.last_samples();
        let slow = samples.iter().find(|s| s.source_id == "slow").unwrap();
        assert!(!slow.success);
        assert!(slow.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_partial_replacement_drops_failed_sources() {
        let a = FakeSource::ok("a", 1.0);
        let b = FakeSource::ok("b", 2.0);
        let agg = aggregator(vec![a.clone(), b.clone()]);
        agg.sync().await;
        assert_eq!(agg.consensus().offsets.len(), 2);
        assert_eq!(agg.consensus_offset(), 1.5);

        b.set_failing(true);
        agg.sync().await;
        let offsets = agg.consensus().offsets;
        assert_eq!(offsets.len(), 1);
        assert!(!offsets.contains_key("b"));
        assert_eq!(agg.consensus_offset(), 1.0);
    }

    #[tokio::test]
    async fn test_all_failed_keeps_previous_consensus() {
        let never = aggregator(vec![FakeSource::failing("x")]);
        assert_eq!(never.sync().await, SyncOutcome::AllFailed { failed: 1 });
        assert!(never.consensus().offsets.is_empty());
        assert_eq!(never.consensus_offset(), 0.0);

        let source = FakeSource::ok("a", 0.25);
        let agg = aggregator(vec![source.clone()]);
        assert!(agg.force_sync().await);
        let before = agg.consensus();

        source.set_failing(true);
        assert!(!agg.force_sync().await);
        assert_eq!(agg.consensus(), before);
        assert_eq!(agg.consensus_offset(), 0.25);

        let stats = agg.statistics();
        assert_eq!(stats.total_syncs, 2);
        assert_eq!(stats.successful_syncs, 1);
        assert_eq!(stats.failed_syncs, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.active_sources, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_single_flight() {
        let slow = FakeSource::slow("slow", 0.1, Duration::from_millis(100));
        let agg = aggregator(vec![slow.clone()]);

        let (first, second) = tokio::join!(agg.sync(), agg.sync());
        let outcomes = [first, second];
        assert!(outcomes.contains(&SyncOutcome::AlreadyRunning));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

        // The flag is released afterwards
        assert!(agg.force_sync().await);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_triggers_lazy_sync_only_when_stale() {
        let source = FakeSource::ok("ntp.example", -0.5);
        let agg = aggregator(vec![source.clone()]);

        let snapshot = agg.verification_snapshot().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let entry = snapshot.get("ntp.example").unwrap();
        assert_eq!(entry.offset, -0.5);
        assert!(entry.last_sync > 0.0);
        assert!(parse_timestamp(&entry.timestamp).is_ok());

        // Fresh consensus: no second query
        agg.verification_snapshot().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_implausible_offset_is_a_failed_sample() {
        // An API reporting microseconds where seconds were expected
        let absurd = 1.7e15 - unix_now();
        let agg = aggregator(vec![
            FakeSource::ok("micros", absurd),
            FakeSource::ok("nan", f64::NAN),
            FakeSource::ok("good", 0.5),
        ]);

        assert_eq!(
            agg.sync().await,
            SyncOutcome::Updated {
                succeeded: 1,
                failed: 2
            }
        );
        assert_eq!(agg.consensus_offset(), 0.5);
        let samples = agg.last_samples();
        let micros = samples.iter().find(|s| s.source_id == "micros").unwrap();
        assert!(micros.error.as_deref().unwrap().contains("implausible"));

        let now = format_timestamp(&Utc::now());
        assert!(agg.verify_timestamp(&now, 30.0).valid);
        assert_eq!(agg.verification_snapshot().await.len(), 1);

        let alone = aggregator(vec![FakeSource::ok("micros", absurd)]);
        assert_eq!(alone.sync().await, SyncOutcome::AllFailed { failed: 1 });
        let diff = (alone.current_time() - Utc::now()).num_milliseconds().abs();
        assert!(diff < 100);
    }

    #[test]
    fn test_shift_out_of_range_keeps_base() {
        let now = Utc::now();
        assert_eq!(shifted(now, 1.7e15), now);
        assert_eq!(shifted(now, -1e300), now);
        assert_eq!(shifted(now, 1.5), now + ChronoDuration::milliseconds(1500));
    }

    #[test]
    fn test_verify_timestamp() {
        let agg = aggregator(vec![]);
        let now = format_timestamp(&Utc::now());
        let check = agg.verify_timestamp(&now, 30.0);
        assert!(check.valid);
        assert!(check.difference.unwrap() < 1.0);

        let old = format_timestamp(&(Utc::now() - ChronoDuration::seconds(120)));
        let check = agg.verify_timestamp(&old, 30.0);
        assert!(!check.valid);
        assert!(check.difference.unwrap() >= 119.0);

        let check = agg.verify_timestamp("garbage", 30.0);
        assert!(!check.valid);
        assert!(check.error.is_some());
        assert_eq!(check.tolerance, 30.0);
    }
}

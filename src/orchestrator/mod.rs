//! Proof packet assembly, the continuous generation loop and verification.
//!
//! The orchestrator reads from the time aggregator, the identity builder and
//! the chain cache; none of them call back into it. Packets produced by one
//! orchestrator carry strictly increasing sequence numbers, and observers see
//! the loop's packets in that order.

pub mod encoder;
pub mod observer;

pub use encoder::{encode_packet, EncodedPacket, PacketEncoder, Utf8FrameEncoder};
pub use observer::{wrap_user_data, ObserverId, PacketObserver, UserDataProvider};

use crate::chain::{ChainHashCache, ChainStats};
use crate::config::{positive_secs, Config};
use crate::identity::{IdentityBuilder, IdentityStats};
use crate::models::{format_timestamp, ProofPacket, VerificationReport};
use crate::time::{TimeAggregator, TimeStats};
use observer::ObserverList;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settings for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Default cadence of the continuous loop.
    pub update_interval: Duration,
    /// Largest accepted distance, in seconds, between a packet's timestamp
    /// and consensus time during verification.
    pub max_time_drift: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            max_time_drift: 30.0,
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        let defaults = Self::default();
        let max_time_drift = config.verification.max_time_drift_secs;
        Self {
            update_interval: positive_secs(config.general.update_interval_secs)
                .unwrap_or(defaults.update_interval),
            max_time_drift: if max_time_drift.is_finite() && max_time_drift > 0.0 {
                max_time_drift
            } else {
                defaults.max_time_drift
            },
        }
    }
}

/// Orchestrator statistics, including those of its components.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub running: bool,
    pub packets_generated: u64,
    pub next_sequence: u64,
    pub loop_iterations: u64,
    pub observers: usize,
    pub observer_failures: u64,
    pub user_data_failures: u64,
    pub verifications: u64,
    pub time: TimeStats,
    pub chains: ChainStats,
    pub identity: IdentityStats,
}

#[derive(Default)]
struct Counters {
    packets_generated: u64,
    loop_iterations: u64,
    observer_failures: u64,
    user_data_failures: u64,
    verifications: u64,
}

struct Shared {
    time: Arc<TimeAggregator>,
    chains: ChainHashCache,
    identity: Arc<IdentityBuilder>,
    encoder: Arc<dyn PacketEncoder>,
    settings: OrchestratorSettings,
    observers: ObserverList,
    user_data: RwLock<Option<Arc<dyn UserDataProvider>>>,
    sequence: AtomicU64,
    last_packet: RwLock<Option<ProofPacket>>,
    counters: Mutex<Counters>,
}

#[derive(Default)]
struct LoopControl {
    stop: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Composes the components into sequenced proof packets.
pub struct Orchestrator {
    shared: Arc<Shared>,
    control: Mutex<LoopControl>,
}

impl Orchestrator {
    pub fn new(
        time: Arc<TimeAggregator>,
        chains: ChainHashCache,
        identity: Arc<IdentityBuilder>,
        encoder: Arc<dyn PacketEncoder>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                time,
                chains,
                identity,
                encoder,
                settings,
                observers: ObserverList::default(),
                user_data: RwLock::new(None),
                sequence: AtomicU64::new(0),
                last_packet: RwLock::new(None),
                counters: Mutex::new(Counters::default()),
            }),
            control: Mutex::new(LoopControl::default()),
        }
    }

    /// Build every component from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(TimeAggregator::from_config(&config.time)),
            ChainHashCache::from_config(&config.chains),
            Arc::new(IdentityBuilder::from_config(&config.identity)),
            Arc::new(Utf8FrameEncoder::new(config.encoder.max_data_size)),
            OrchestratorSettings::from(config),
        )
    }

    pub fn time(&self) -> &TimeAggregator {
        &self.shared.time
    }

    pub fn chains(&self) -> &ChainHashCache {
        &self.shared.chains
    }

    pub fn identity(&self) -> &IdentityBuilder {
        &self.shared.identity
    }

    /// First time sync, waited for, plus background refresh of every chain.
    ///
    /// Returns whether the time sync succeeded.
    pub async fn warm_up(&self) -> bool {
        for chain in self.shared.chains.enabled_chains() {
            self.shared.chains.request_refresh(chain);
        }
        let synced = self.shared.time.force_sync().await;
        if !synced {
            warn!("Initial time sync failed, using local clock");
        }
        synced
    }

    /// Assemble one packet.
    pub async fn generate_once(&self, user_data: Option<Value>) -> ProofPacket {
        self.shared.generate(user_data).await
    }

    /// The most recently generated packet.
    pub fn current_packet(&self) -> Option<ProofPacket> {
        self.shared.last_packet.read().clone()
    }

    /// Serialize and frame a packet with the configured encoder.
    pub fn encode(&self, packet: &ProofPacket) -> Result<EncodedPacket, serde_json::Error> {
        encode_packet(packet, self.shared.encoder.as_ref())
    }

    /// Start the continuous loop. Does nothing if it is already running.
    ///
    /// `interval` defaults to the configured update interval. Returns true
    /// when a new loop was started. Must be called from within a Tokio runtime.
    pub fn start_continuous(&self, interval: Option<Duration>) -> bool {
        let mut control = self.control.lock();
        if control.stop.is_some() && control.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Continuous generation already running");
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Cannot start continuous generation outside a Tokio runtime");
            return false;
        };

        let interval = interval
            .filter(|i| !i.is_zero())
            .unwrap_or(self.shared.settings.update_interval);
        let (stop_tx, stop_rx) = watch::channel(false);
        // A loop that was asked to stop may still be finishing its iteration
        let previous = control.handle.take();

        let shared = Arc::clone(&self.shared);
        control.handle = Some(runtime.spawn(run_loop(shared, interval, stop_rx, previous)));
        control.stop = Some(stop_tx);

        info!("Continuous generation started ({:.2}s interval)", interval.as_secs_f64());
        true
    }

    /// Ask the loop to stop after its current iteration. Returns whether it
    /// was running.
    pub fn stop(&self) -> bool {
        let mut control = self.control.lock();
        match control.stop.take() {
            Some(stop) => {
                let _ = stop.send(true);
                info!("Stopping continuous generation");
                true
            }
            None => false,
        }
    }

    /// Stop the loop and wait for its last iteration to finish.
    pub async fn stop_and_wait(&self) {
        self.stop();
        let handle = self.control.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Generation loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let control = self.control.lock();
        control.stop.is_some() && control.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Add an observer; it receives every packet the loop produces.
    pub fn register_observer<O: PacketObserver + 'static>(&self, observer: O) -> ObserverId {
        self.shared.observers.register(Arc::new(observer))
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.unregister(id)
    }

    /// Set the capability consulted for `user_data` on every loop iteration.
    pub fn set_user_data_provider<P: UserDataProvider + 'static>(&self, provider: P) {
        *self.shared.user_data.write() = Some(Arc::new(provider));
    }

    pub fn clear_user_data_provider(&self) {
        *self.shared.user_data.write() = None;
    }

    /// Check a serialized packet against current state.
    ///
    /// The three checks are independent. Chain verification is any-match:
    /// one embedded chain hash equal to the cached hash is enough.
    pub fn verify_packet(&self, serialized: &str) -> VerificationReport {
        self.shared.counters.lock().verifications += 1;

        let packet = match ProofPacket::from_json(serialized) {
            Ok(packet) => packet,
            Err(e) => return VerificationReport::malformed(e.to_string()),
        };

        let shared = &self.shared;
        let identity_verified = shared.identity.get_digest() == packet.identity_hash;

        let time_check = shared
            .time
            .verify_timestamp(&packet.timestamp, shared.settings.max_time_drift);
        if let Some(error) = &time_check.error {
            debug!("Packet timestamp rejected: {}", error);
        }

        let blockchain_verified = packet
            .blockchain_hashes
            .iter()
            .any(|(chain, hash)| shared.chains.verify_hash(chain, hash).valid);

        VerificationReport {
            valid_json: true,
            error: None,
            identity_verified,
            time_verified: time_check.valid,
            blockchain_verified,
            chains_in_packet: packet.blockchain_hashes.len(),
        }
    }

    pub fn statistics(&self) -> OrchestratorStats {
        let shared = &self.shared;
        let (packets_generated, loop_iterations, observer_failures, user_data_failures, verifications) = {
            let c = shared.counters.lock();
            (
                c.packets_generated,
                c.loop_iterations,
                c.observer_failures,
                c.user_data_failures,
                c.verifications,
            )
        };

        OrchestratorStats {
            running: self.is_running(),
            packets_generated,
            next_sequence: shared.sequence.load(Ordering::SeqCst),
            loop_iterations,
            observers: shared.observers.len(),
            observer_failures,
            user_data_failures,
            verifications,
            time: shared.time.statistics(),
            chains: shared.chains.statistics(),
            identity: shared.identity.statistics(),
        }
    }
}

impl Shared {
    async fn generate(&self, user_data: Option<Value>) -> ProofPacket {
        let now = self.time.current_time();
        let identity_hash = self.identity_digest().await;
        let blockchain_hashes = self.chains.get_hashes();
        let time_server_verification = self.time.verification_snapshot().await;

        let packet = ProofPacket {
            timestamp: format_timestamp(&now),
            identity_hash,
            blockchain_hashes,
            time_server_verification,
            user_data,
            sequence_number: self.sequence.fetch_add(1, Ordering::SeqCst),
        };

        *self.last_packet.write() = Some(packet.clone());
        self.counters.lock().packets_generated += 1;
        debug!(
            "Generated packet {} ({} chains, {} time sources)",
            packet.sequence_number,
            packet.blockchain_hashes.len(),
            packet.time_server_verification.len()
        );
        packet
    }

    /// Digest computed on a blocking thread, since tracked files are read from disk.
    async fn identity_digest(&self) -> String {
        if tokio::runtime::Handle::try_current().is_err() {
            return self.identity.get_digest();
        }

        let identity = Arc::clone(&self.identity);
        match tokio::task::spawn_blocking(move || identity.get_digest()).await {
            Ok(digest) => digest,
            Err(e) => {
                error!("Identity digest task failed: {}", e);
                String::new()
            }
        }
    }

    fn pull_user_data(&self) -> Option<Value> {
        let provider = self.user_data.read().clone()?;
        match catch_unwind(AssertUnwindSafe(|| provider.user_data())) {
            Ok(Ok(Some(Value::String(text)))) if text.is_empty() => None,
            Ok(Ok(value)) => value.map(wrap_user_data),
            Ok(Err(e)) => {
                self.counters.lock().user_data_failures += 1;
                warn!("User data provider failed: {:#}", e);
                None
            }
            Err(_) => {
                self.counters.lock().user_data_failures += 1;
                error!("User data provider panicked");
                None
            }
        }
    }

    async fn iteration(&self) {
        let user_data = self.pull_user_data();
        let packet = self.generate(user_data).await;

        let encoded = match encode_packet(&packet, self.encoder.as_ref()) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to serialize packet {}: {}", packet.sequence_number, e);
                return;
            }
        };

        let failures = self.observers.dispatch(&packet, &encoded);
        let mut counters = self.counters.lock();
        counters.loop_iterations += 1;
        counters.observer_failures += failures as u64;
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    loop {
        if *stop.borrow() {
            break;
        }

        let started = Instant::now();
        shared.iteration().await;
        let remaining = interval.saturating_sub(started.elapsed());

        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!("Continuous generation stopped");
}

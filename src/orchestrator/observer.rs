//! Packet observers and the user-data capability.

use crate::models::ProofPacket;
use crate::orchestrator::encoder::EncodedPacket;
use anyhow::Result;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Receives every packet produced by the continuous loop.
///
/// Observers run on the loop task, in registration order. They should
/// return quickly; a slow observer delays the next packet.
pub trait PacketObserver: Send + Sync {
    fn on_packet(&self, packet: &ProofPacket, encoded: &EncodedPacket) -> Result<()>;
}

impl<F> PacketObserver for F
where
    F: Fn(&ProofPacket, &EncodedPacket) -> Result<()> + Send + Sync,
{
    fn on_packet(&self, packet: &ProofPacket, encoded: &EncodedPacket) -> Result<()> {
        self(packet, encoded)
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Supplies the `user_data` of each packet generated by the loop.
pub trait UserDataProvider: Send + Sync {
    fn user_data(&self) -> Result<Option<Value>>;
}

impl<F> UserDataProvider for F
where
    F: Fn() -> Result<Option<Value>> + Send + Sync,
{
    fn user_data(&self) -> Result<Option<Value>> {
        self()
    }
}

/// Plain strings become `{"user_text": ...}`; other values pass through.
pub fn wrap_user_data(value: Value) -> Value {
    match value {
        Value::String(text) => json!({ "user_text": text }),
        other => other,
    }
}

/// Ordered, concurrently modifiable list of observers.
#[derive(Default)]
pub(crate) struct ObserverList {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ObserverId, Arc<dyn PacketObserver>)>>,
}

impl ObserverList {
    pub(crate) fn register(&self, observer: Arc<dyn PacketObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, observer));
        id
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Call every observer registered at the start of the dispatch.
    ///
    /// Errors and panics are logged and counted; the remaining observers
    /// still run. Returns the number of failures.
    pub(crate) fn dispatch(&self, packet: &ProofPacket, encoded: &EncodedPacket) -> usize {
        let snapshot: Vec<_> = self.entries.read().clone();
        let mut failures = 0;

        for (id, observer) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_packet(packet, encoded)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("Observer {:?} failed on packet {}: {:#}", id, packet.sequence_number, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("Observer {:?} panicked on packet {}", id, packet.sequence_number);
                }
            }
        }

        debug!("Dispatched packet {} ({} failures)", packet.sequence_number, failures);
        failures
    }
}

//! Data models for proof packets and verification results.
//!
//! This module contains the wire format of a proof packet together with
//! the records and check results exchanged between components.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Format a timestamp the way it is embedded in packets.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 timestamp. A missing offset is read as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

/// Per-source entry of the time section of a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeVerification {
    /// Absolute time derived from this source's offset.
    pub timestamp: String,
    /// Offset of the source relative to the local clock, in seconds.
    pub offset: f64,
    /// Unix time (seconds) of the sync round that produced the offset.
    pub last_sync: f64,
}

/// The serialized bundle produced on every generation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofPacket {
    pub timestamp: String,
    pub identity_hash: String,
    pub blockchain_hashes: BTreeMap<String, String>,
    pub time_server_verification: BTreeMap<String, TimeVerification>,
    pub user_data: Option<Value>,
    pub sequence_number: u64,
}

impl ProofPacket {
    /// Compact JSON form, as handed to the frame encoder.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a packet from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Outcome of a single time-source query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampSample {
    pub source_id: String,
    pub success: bool,
    pub offset_seconds: f64,
    pub round_trip_delay: f64,
    pub stratum_or_rank: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TimestampSample {
    pub fn failed(source_id: &str, error: String) -> Self {
        Self {
            source_id: source_id.to_string(),
            success: false,
            offset_seconds: 0.0,
            round_trip_delay: 0.0,
            stratum_or_rank: 0,
            error: Some(error),
        }
    }
}

/// Cached tip of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub chain_id: String,
    pub block_height: u64,
    pub block_hash: String,
    /// Block time as reported by the source, when it reports one.
    pub observed_at: Option<DateTime<Utc>>,
    /// Local time at which the record was stored.
    pub retrieved_at: DateTime<Utc>,
    pub ttl_expiry: DateTime<Utc>,
}

impl ChainRecord {
    /// Whether the record is past its time-to-live at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl_expiry
    }
}

/// Result of checking a timestamp against consensus time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<f64>,
    pub tolerance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of checking a block hash against the cache.
///
/// This is exact-match verification against the most recently cached tip,
/// not ledger validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashCheck {
    pub valid: bool,
    pub chain: String,
    pub given_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_age_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of verifying a serialized packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub valid_json: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub identity_verified: bool,
    pub time_verified: bool,
    pub blockchain_verified: bool,
    /// Number of chains embedded in the packet.
    pub chains_in_packet: usize,
}

impl VerificationReport {
    /// Report for input that is not a packet.
    pub fn malformed(error: String) -> Self {
        Self {
            valid_json: false,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Combined verdict: identity and time must hold, and the chain check
    /// must hold whenever the packet embeds any chain hash.
    ///
    /// The individual checks are authoritative; this combination is a
    /// recommended policy, not part of the packet format.
    pub fn overall_valid(&self) -> bool {
        self.valid_json
            && self.identity_verified
            && self.time_verified
            && (self.chains_in_packet == 0 || self.blockchain_verified)
    }
}

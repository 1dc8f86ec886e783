//! livestamp - verifiable proof packets for live streams.
//!
//! A proof packet bundles a consensus timestamp, a stable identity digest
//! and the current block hashes of public chains. Packets are meant to be
//! embedded in a visual code so a viewer can later recompute the same
//! values and compare.
//!
//! The [`orchestrator::Orchestrator`] composes the three data components:
//!
//! - [`time::TimeAggregator`]: median clock offset over NTP and HTTP sources
//! - [`chain::ChainHashCache`]: per-chain block hash cache with TTL refresh
//! - [`identity::IdentityBuilder`]: digest over host descriptors, files and
//!   custom fields

pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod time;

pub use config::Config;
pub use error::{EncodeError, SourceError};
pub use models::{ProofPacket, VerificationReport};
pub use orchestrator::Orchestrator;

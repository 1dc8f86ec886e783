//! Time consensus from NTP servers and HTTP time APIs.

pub mod aggregator;
pub mod sources;

pub use aggregator::{median, SyncOutcome, TimeAggregator, TimeConsensus, TimeSettings, TimeStats};
pub use sources::{HttpTimeSource, NtpSource, TimeReading, TimeSource};

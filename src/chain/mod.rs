//! Current block hashes of public blockchains.

pub mod cache;
pub mod endpoints;

pub use cache::{ChainHashCache, ChainSettings, ChainStats};
pub use endpoints::{BlockCypherEndpoint, ChainEndpoint, EsploraEndpoint, TipObservation};

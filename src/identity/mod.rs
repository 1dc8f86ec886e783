//! Stable identity fingerprint built from host descriptors, tracked files
//! and custom fields.

pub mod builder;
pub mod hasher;
pub mod system;

pub use builder::{IdentityBuilder, IdentityRecord, IdentitySettings, IdentityStats};
pub use hasher::HashAlgorithm;

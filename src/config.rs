//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.livestamp.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".livestamp.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Time source settings.
    #[serde(default)]
    pub time: TimeConfig,

    /// Chain hash cache settings.
    #[serde(default)]
    pub chains: ChainConfig,

    /// Identity digest settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Packet verification settings.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Frame encoder settings.
    #[serde(default)]
    pub encoder: EncoderConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Seconds between packets in continuous mode.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: f64,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            verbose: false,
        }
    }
}

fn default_update_interval() -> f64 {
    5.0
}

/// Time oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// NTP servers queried on every sync.
    #[serde(default = "default_ntp_servers")]
    pub ntp_servers: Vec<String>,

    /// HTTP time APIs queried on every sync.
    #[serde(default = "default_http_apis")]
    pub http_apis: Vec<String>,

    /// Per-source timeout in seconds.
    #[serde(default = "default_time_timeout")]
    pub timeout_secs: f64,

    /// Consensus older than this is refreshed lazily.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: f64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            ntp_servers: default_ntp_servers(),
            http_apis: default_http_apis(),
            timeout_secs: default_time_timeout(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

fn default_ntp_servers() -> Vec<String> {
    vec![
        "time.nist.gov",
        "pool.ntp.org",
        "time.google.com",
        "time.cloudflare.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_http_apis() -> Vec<String> {
    vec![
        "http://worldtimeapi.org/api/timezone/UTC",
        "https://timeapi.io/api/Time/current/zone?timeZone=UTC",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_time_timeout() -> f64 {
    5.0
}

fn default_refresh_interval() -> f64 {
    60.0
}

/// Kind of explorer API behind a chain endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Esplora-style API (`/blocks/tip/hash`, `/block/{hash}`).
    Esplora,
    /// BlockCypher-style chain summary.
    BlockCypher,
}

/// One redundant endpoint for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub kind: EndpointKind,
    pub url: String,
}

impl EndpointSpec {
    fn new(kind: EndpointKind, url: &str) -> Self {
        Self {
            kind,
            url: url.to_string(),
        }
    }
}

/// Chain hash cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chains embedded in packets.
    #[serde(default = "default_enabled_chains")]
    pub enabled: Vec<String>,

    /// Seconds a cached block hash stays fresh.
    #[serde(default = "default_cache_duration")]
    pub cache_duration_secs: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_chain_timeout")]
    pub timeout_secs: f64,

    /// Prioritized endpoints per chain. Chains missing here use the built-in table.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Vec<EndpointSpec>>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_chains(),
            cache_duration_secs: default_cache_duration(),
            timeout_secs: default_chain_timeout(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl ChainConfig {
    /// Endpoints for `chain`, configured ones first, else the built-in table.
    pub fn endpoints_for(&self, chain: &str) -> Vec<EndpointSpec> {
        if let Some(list) = self.endpoints.get(chain) {
            return list.clone();
        }
        default_endpoints(chain)
    }
}

fn default_enabled_chains() -> Vec<String> {
    vec!["bitcoin", "ethereum", "litecoin"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_cache_duration() -> u64 {
    300 // 5 minutes
}

fn default_chain_timeout() -> f64 {
    10.0
}

/// Built-in redundant endpoint table.
pub fn default_endpoints(chain: &str) -> Vec<EndpointSpec> {
    use EndpointKind::{BlockCypher, Esplora};

    match chain {
        "bitcoin" => vec![
            EndpointSpec::new(Esplora, "https://blockstream.info/api"),
            EndpointSpec::new(Esplora, "https://mempool.space/api"),
            EndpointSpec::new(BlockCypher, "https://api.blockcypher.com/v1/btc/main"),
        ],
        "ethereum" => vec![EndpointSpec::new(
            BlockCypher,
            "https://api.blockcypher.com/v1/eth/main",
        )],
        "litecoin" => vec![
            EndpointSpec::new(BlockCypher, "https://api.blockcypher.com/v1/ltc/main"),
            EndpointSpec::new(Esplora, "https://litecoinspace.org/api"),
        ],
        _ => Vec::new(),
    }
}

/// Identity digest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Identity document to import at startup (and to export to).
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Create a fresh identity when no document can be imported.
    #[serde(default = "default_true")]
    pub auto_generate: bool,

    /// Digest algorithm: sha256, sha512 or md5.
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,

    /// Include system descriptors in a fresh identity.
    #[serde(default = "default_true")]
    pub include_system_info: bool,

    /// Track the identity file's content hash in a fresh identity.
    #[serde(default = "default_true")]
    pub include_file_hash: bool,

    /// Seconds a computed digest is reused before recomputing.
    #[serde(default = "default_identity_cache")]
    pub cache_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            auto_generate: true,
            hash_algorithm: default_hash_algorithm(),
            include_system_info: true,
            include_file_hash: true,
            cache_secs: default_identity_cache(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_hash_algorithm() -> String {
    "sha256".to_string()
}

fn default_identity_cache() -> u64 {
    60
}

/// Packet verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Maximum seconds between a packet timestamp and consensus time.
    #[serde(default = "default_max_time_drift")]
    pub max_time_drift_secs: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_time_drift_secs: default_max_time_drift(),
        }
    }
}

fn default_max_time_drift() -> f64 {
    30.0
}

/// Frame encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Maximum payload bytes per frame.
    #[serde(default = "default_max_data_size")]
    pub max_data_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_data_size: default_max_data_size(),
        }
    }
}

fn default_max_data_size() -> usize {
    2000
}

/// Convert a seconds value to a duration, or `None` when it is not usable.
pub fn positive_secs(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if args.verbose {
            self.general.verbose = true;
        }

        if let Some(ref identity_file) = args.identity_file {
            self.identity.identity_file = Some(identity_file.clone());
        }

        if let Some(ref chains) = args.chains {
            self.chains.enabled = chains.clone();
        }

        if let Some(interval) = args.command.interval() {
            self.general.update_interval_secs = interval;
        }
    }

    /// Replace unusable values with their defaults.
    ///
    /// Non-positive intervals, timeouts and tolerances fall back to the
    /// built-in defaults with a warning instead of aborting.
    pub fn sanitized(mut self) -> Self {
        fn fix(name: &str, value: &mut f64, fallback: f64) {
            if positive_secs(*value).is_none() {
                warn!("{} must be a positive duration (got {}), using {}", name, value, fallback);
                *value = fallback;
            }
        }

        fix(
            "general.update_interval_secs",
            &mut self.general.update_interval_secs,
            default_update_interval(),
        );
        fix(
            "time.timeout_secs",
            &mut self.time.timeout_secs,
            default_time_timeout(),
        );
        fix(
            "time.refresh_interval_secs",
            &mut self.time.refresh_interval_secs,
            default_refresh_interval(),
        );
        fix(
            "chains.timeout_secs",
            &mut self.chains.timeout_secs,
            default_chain_timeout(),
        );

        if !self.verification.max_time_drift_secs.is_finite()
            || self.verification.max_time_drift_secs < 0.0
        {
            warn!(
                "verification.max_time_drift_secs must be non-negative, using {}",
                default_max_time_drift()
            );
            self.verification.max_time_drift_secs = default_max_time_drift();
        }

        if self.chains.cache_duration_secs == 0 {
            warn!(
                "chains.cache_duration_secs must be positive, using {}",
                default_cache_duration()
            );
            self.chains.cache_duration_secs = default_cache_duration();
        }

        if self.encoder.max_data_size == 0 {
            self.encoder.max_data_size = default_max_data_size();
        }

        self
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.update_interval_secs, 5.0);
        assert_eq!(config.chains.cache_duration_secs, 300);
        assert_eq!(config.identity.hash_algorithm, "sha256");
        assert!(config.chains.enabled.contains(&"bitcoin".to_string()));
        assert_eq!(config.time.ntp_servers.len(), 4);
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
update_interval_secs = 1.5
verbose = true

[chains]
enabled = ["bitcoin"]
cache_duration_secs = 60

[[chains.endpoints.bitcoin]]
kind = "blockcypher"
url = "http://localhost:9000/btc"

[identity]
hash_algorithm = "sha512"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.update_interval_secs, 1.5);
        assert!(config.general.verbose);
        assert_eq!(config.chains.enabled, vec!["bitcoin"]);
        assert_eq!(config.identity.hash_algorithm, "sha512");
        assert_eq!(
            config.chains.endpoints_for("bitcoin"),
            vec![EndpointSpec::new(
                EndpointKind::BlockCypher,
                "http://localhost:9000/btc"
            )]
        );
        // Untouched sections keep their defaults
        assert_eq!(config.verification.max_time_drift_secs, 30.0);
        assert_eq!(config.chains.endpoints_for("litecoin").len(), 2);
    }

    #[test]
    fn test_sanitized_falls_back_to_defaults() {
        let mut config = Config::default();
        config.general.update_interval_secs = 0.0;
        config.time.timeout_secs = -3.0;
        config.chains.cache_duration_secs = 0;
        config.verification.max_time_drift_secs = f64::NAN;
        config.time.refresh_interval_secs = 1e30;

        let config = config.sanitized();
        assert_eq!(config.general.update_interval_secs, 5.0);
        assert_eq!(config.time.timeout_secs, 5.0);
        assert_eq!(config.time.refresh_interval_secs, 60.0);
        assert_eq!(config.chains.cache_duration_secs, 300);
        assert_eq!(config.verification.max_time_drift_secs, 30.0);
    }

    #[test]
    fn test_positive_secs() {
        assert_eq!(positive_secs(1.5), Some(Duration::from_millis(1500)));
        assert_eq!(positive_secs(0.0), None);
        assert_eq!(positive_secs(-1.0), None);
        assert_eq!(positive_secs(f64::NAN), None);
        assert_eq!(positive_secs(f64::INFINITY), None);
        assert_eq!(positive_secs(1e30), None);
    }

    #[test]
    fn test_default_endpoint_table() {
        assert_eq!(default_endpoints("bitcoin").len(), 3);
        assert_eq!(default_endpoints("bitcoin")[0].kind, EndpointKind::Esplora);
        assert!(default_endpoints("dogecoin").is_empty());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[time]"));
        assert!(toml_str.contains("[identity]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.encoder.max_data_size, 2000);
    }

    #[test]
    fn test_merge_with_args() {
        use clap::Parser;

        let args = crate::cli::Args::try_parse_from([
            "livestamp",
            "live",
            "--interval",
            "0.5",
            "--chains",
            "litecoin",
            "--identity-file",
            "me.id",
            "--verbose",
        ])
        .unwrap();

        let mut config = Config::default();
        config.merge_with_args(&args);
        assert_eq!(config.general.update_interval_secs, 0.5);
        assert!(config.general.verbose);
        assert_eq!(config.chains.enabled, vec!["litecoin"]);
        assert_eq!(config.identity.identity_file, Some(PathBuf::from("me.id")));

        // Flags not given leave the file values alone
        let args = crate::cli::Args::try_parse_from(["livestamp", "status"]).unwrap();
        let mut config = Config::default();
        config.merge_with_args(&args);
        assert_eq!(config.general.update_interval_secs, 5.0);
        assert_eq!(config.chains.enabled.len(), 3);
    }
}

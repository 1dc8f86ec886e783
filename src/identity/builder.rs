//! Deterministic identity fingerprint.
//!
//! The digest covers three optional categories (host descriptors, tracked
//! file hashes and custom fields) plus the identity's creation time. Each
//! category is serialized with sorted keys, labelled, and the labelled
//! segments are joined with `|` before hashing:
//!
//! ```text
//! system:{...}|files:{...}|custom:{...}|created:2024-05-01T12:00:00.000000Z
//! ```
//!
//! Empty categories are left out entirely.

use crate::config::IdentityConfig;
use crate::identity::hasher::HashAlgorithm;
use crate::identity::system;
use crate::models::format_timestamp;
use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SEGMENT_DELIMITER: &str = "|";
const DOCUMENT_VERSION: &str = "1.0";
/// Alias under which the configured identity file tracks itself.
pub const IDENTITY_FILE_ALIAS: &str = "identity_file";

/// Full identity state, also the on-disk export format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Digest at the time of export; recomputed after import.
    #[serde(default)]
    pub identity_hash: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub system_info: BTreeMap<String, Value>,
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub custom_data: BTreeMap<String, Value>,
    /// Source path of each tracked file, used for change detection.
    #[serde(default)]
    pub file_paths: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

impl IdentityRecord {
    /// Fresh identity created now, with no descriptors.
    pub fn blank() -> Self {
        Self {
            identity_hash: String::new(),
            creation_time: Utc::now().trunc_subsecs(6),
            system_info: BTreeMap::new(),
            file_hashes: BTreeMap::new(),
            custom_data: BTreeMap::new(),
            file_paths: BTreeMap::new(),
            algorithm: None,
            version: default_version(),
        }
    }

    /// The exact string that is hashed into the digest.
    pub fn canonical_string(&self) -> String {
        let mut segments = Vec::with_capacity(4);

        if !self.system_info.is_empty() {
            segments.push(format!("system:{}", canonical(&self.system_info)));
        }
        if !self.file_hashes.is_empty() {
            segments.push(format!("files:{}", canonical(&self.file_hashes)));
        }
        if !self.custom_data.is_empty() {
            segments.push(format!("custom:{}", canonical(&self.custom_data)));
        }
        segments.push(format!("created:{}", format_timestamp(&self.creation_time)));

        segments.join(SEGMENT_DELIMITER)
    }
}

fn canonical<T: Serialize>(map: &BTreeMap<String, T>) -> String {
    // BTreeMap keys and serde_json objects both serialize in sorted order
    serde_json::to_string(map).unwrap_or_default()
}

/// Settings for an [`IdentityBuilder`].
#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub algorithm: HashAlgorithm,
    /// How long a computed digest is reused when nothing changed.
    pub cache_window: Duration,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            cache_window: Duration::from_secs(60),
        }
    }
}

impl From<&IdentityConfig> for IdentitySettings {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            algorithm: HashAlgorithm::from_name(&config.hash_algorithm),
            cache_window: Duration::from_secs(config.cache_secs),
        }
    }
}

/// Identity statistics.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
    pub digest_generations: u64,
    pub file_reads: u64,
    pub has_identity: bool,
    pub has_cached_digest: bool,
    pub file_count: usize,
    pub custom_field_count: usize,
    pub algorithm: &'static str,
}

struct CachedDigest {
    hex: String,
    computed_at: Instant,
}

#[derive(Default)]
struct IdentityState {
    record: Option<IdentityRecord>,
    cached: Option<CachedDigest>,
    digest_generations: u64,
    file_reads: u64,
}

impl IdentityState {
    fn record_mut(&mut self) -> &mut IdentityRecord {
        self.cached = None;
        self.record.get_or_insert_with(IdentityRecord::blank)
    }
}

/// Owner of the identity state and its cached digest.
pub struct IdentityBuilder {
    settings: IdentitySettings,
    state: Mutex<IdentityState>,
}

impl IdentityBuilder {
    /// Builder over a blank identity created now.
    pub fn new(settings: IdentitySettings) -> Self {
        Self::with_record(settings, Some(IdentityRecord::blank()))
    }

    fn with_record(settings: IdentitySettings, record: Option<IdentityRecord>) -> Self {
        Self {
            settings,
            state: Mutex::new(IdentityState {
                record,
                ..Default::default()
            }),
        }
    }

    /// Apply the startup policy: import the configured identity file when
    /// it exists, otherwise generate a new identity if allowed.
    pub fn from_config(config: &IdentityConfig) -> Self {
        let settings = IdentitySettings::from(config);
        let builder = Self::with_record(settings, None);

        if let Some(path) = config.identity_file.as_deref().filter(|p| p.is_file()) {
            match builder.import(path) {
                Ok(()) => {
                    info!("Loaded identity from {}", path.display());
                    return builder;
                }
                Err(e) => warn!("Could not import identity from {}: {:#}", path.display(), e),
            }
        }

        if !config.auto_generate {
            info!("No identity loaded and auto-generation is disabled");
            return builder;
        }

        {
            let mut state = builder.state.lock();
            let record = state.record_mut();
            if config.include_system_info {
                record.system_info = system::collect();
            }
        }

        if config.include_file_hash {
            if let Some(path) = config.identity_file.as_deref().filter(|p| p.is_file()) {
                builder.add_file(path, Some(IDENTITY_FILE_ALIAS));
            }
        }

        info!("Generated new identity");
        builder
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.settings.algorithm
    }

    /// Current digest, recomputed when the cache is old or a tracked file changed.
    ///
    /// Returns an empty string when no identity exists. Tracked files are
    /// read without holding the state lock; this still blocks the calling
    /// thread, so async callers should run it on a blocking thread.
    pub fn get_digest(&self) -> String {
        let Some(tracked) = self.tracked_paths() else {
            return String::new();
        };
        let live = self.hash_tracked(&tracked);

        let mut guard = self.state.lock();
        self.apply_file_hashes(&mut guard, live);

        let state = &mut *guard;
        let Some(record) = state.record.as_mut() else {
            return String::new();
        };
        if let Some(cached) = &state.cached {
            if cached.computed_at.elapsed() < self.settings.cache_window {
                return cached.hex.clone();
            }
        }

        let hex = self
            .settings
            .algorithm
            .digest_hex(record.canonical_string().as_bytes());
        record.identity_hash = hex.clone();
        record.algorithm = Some(self.settings.algorithm.name().to_string());

        state.cached = Some(CachedDigest {
            hex: hex.clone(),
            computed_at: Instant::now(),
        });
        state.digest_generations += 1;
        debug!("Identity digest recomputed: {}", hex);
        hex
    }

    /// Tracked files with a known path, or `None` when no identity exists.
    fn tracked_paths(&self) -> Option<BTreeMap<String, PathBuf>> {
        self.state.lock().record.as_ref().map(|r| r.file_paths.clone())
    }

    /// Hash each tracked file from disk. Unreadable files hash to an error marker.
    fn hash_tracked(&self, tracked: &BTreeMap<String, PathBuf>) -> Vec<(String, PathBuf, String)> {
        tracked
            .iter()
            .map(|(alias, path)| {
                let live = match self.settings.algorithm.hash_file(path) {
                    Ok(hex) => hex,
                    Err(e) => format!("error:{}", e),
                };
                (alias.clone(), path.clone(), live)
            })
            .collect()
    }

    /// Store fresh file hashes, dropping the cached digest when one changed.
    ///
    /// Entries whose file was removed or re-added since the read are skipped.
    fn apply_file_hashes(&self, state: &mut IdentityState, live: Vec<(String, PathBuf, String)>) {
        state.file_reads += live.len() as u64;
        let Some(record) = state.record.as_mut() else {
            return;
        };

        let mut changed = false;
        for (alias, path, hex) in live {
            if record.file_paths.get(&alias) != Some(&path) {
                continue;
            }
            if record.file_hashes.get(&alias) != Some(&hex) {
                debug!("Tracked file '{}' changed", alias);
                record.file_hashes.insert(alias, hex);
                changed = true;
            }
        }

        if changed {
            state.cached = None;
        }
    }

    /// Track a file's content hash under `alias` or its base name.
    ///
    /// Returns false if the file cannot be read.
    pub fn add_file(&self, path: &Path, alias: Option<&str>) -> bool {
        let hex = match self.settings.algorithm.hash_file(path) {
            Ok(hex) => hex,
            Err(e) => {
                warn!("Cannot add {} to identity: {}", path.display(), e);
                return false;
            }
        };

        let key = match alias {
            Some(alias) => alias.to_string(),
            None => match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => return false,
            },
        };

        let tracked = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut state = self.state.lock();
        state.file_reads += 1;
        let record = state.record_mut();
        record.file_hashes.insert(key.clone(), hex);
        record.file_paths.insert(key, tracked);
        true
    }

    /// Stop tracking a file. Returns false if `key` was not tracked.
    pub fn remove_file(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let present = state
            .record
            .as_ref()
            .is_some_and(|r| r.file_hashes.contains_key(key));
        if !present {
            return false;
        }

        let record = state.record_mut();
        record.file_hashes.remove(key);
        record.file_paths.remove(key);
        true
    }

    pub fn update_custom_field(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        state.record_mut().custom_data.insert(key.to_string(), value);
    }

    /// Snapshot of the identity with an up-to-date digest.
    pub fn record(&self) -> Option<IdentityRecord> {
        self.get_digest();
        self.state.lock().record.clone()
    }

    /// Write the full identity state as pretty JSON.
    pub fn export(&self, path: &Path) -> Result<()> {
        let record = self.record().context("No identity to export")?;
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write identity file: {}", path.display()))?;
        info!("Exported identity to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory identity with the one stored at `path`.
    pub fn import(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
        let record: IdentityRecord = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity file: {}", path.display()))?;

        if let Some(name) = &record.algorithm {
            if HashAlgorithm::from_name(name) != self.settings.algorithm {
                warn!(
                    "Identity was exported with {}, now using {}",
                    name,
                    self.settings.algorithm.name()
                );
            }
        }

        let mut state = self.state.lock();
        state.record = Some(record);
        state.cached = None;
        Ok(())
    }

    pub fn statistics(&self) -> IdentityStats {
        let state = self.state.lock();
        IdentityStats {
            digest_generations: state.digest_generations,
            file_reads: state.file_reads,
            has_identity: state.record.is_some(),
            has_cached_digest: state.cached.is_some(),
            file_count: state.record.as_ref().map_or(0, |r| r.file_hashes.len()),
            custom_field_count: state.record.as_ref().map_or(0, |r| r.custom_data.len()),
            algorithm: self.settings.algorithm.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn builder() -> IdentityBuilder {
        IdentityBuilder::new(IdentitySettings::default())
    }

    #[test]
    fn test_canonical_string_layout() {
        let mut record = IdentityRecord::blank();
        record.creation_time = "2024-05-01T12:00:00Z".parse().unwrap();
        assert_eq!(record.canonical_string(), "created:2024-05-01T12:00:00.000000Z");

        record.custom_data.insert("b".to_string(), json!(2));
        record.custom_data.insert("a".to_string(), json!({"z": 1, "y": [1, 2]}));
        record.file_hashes.insert("f".to_string(), "00ff".to_string());
        assert_eq!(
            record.canonical_string(),
            r#"files:{"f":"00ff"}|custom:{"a":{"y":[1,2],"z":1},"b":2}|created:2024-05-01T12:00:00.000000Z"#
        );
    }

    #[test]
    fn test_digest_is_cached_and_stable() {
        let builder = builder();
        let first = builder.get_digest();
        assert_eq!(first.len(), 64);
        assert_eq!(builder.get_digest(), first);
        assert_eq!(builder.statistics().digest_generations, 1);
    }

    #[test]
    fn test_custom_field_invalidates() {
        let builder = builder();
        let before = builder.get_digest();
        builder.update_custom_field("stream", json!("main"));
        let after = builder.get_digest();
        assert_ne!(before, after);
        assert_eq!(builder.statistics().custom_field_count, 1);
    }

    #[test]
    fn test_algorithm_changes_digest_length() {
        let sha512 = IdentityBuilder::new(IdentitySettings {
            algorithm: HashAlgorithm::Sha512,
            ..Default::default()
        });
        assert_eq!(sha512.get_digest().len(), 128);

        let md5 = IdentityBuilder::new(IdentitySettings {
            algorithm: HashAlgorithm::Md5,
            ..Default::default()
        });
        assert_eq!(md5.get_digest().len(), 32);
    }

    #[test]
    fn test_add_and_remove_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, b"secret").unwrap();

        let builder = builder();
        let before = builder.get_digest();

        assert!(builder.add_file(&path, None));
        let with_file = builder.get_digest();
        assert_ne!(before, with_file);

        let record = builder.record().unwrap();
        assert_eq!(
            record.file_hashes["key.pem"],
            HashAlgorithm::Sha256.digest_hex(b"secret")
        );

        assert!(builder.remove_file("key.pem"));
        assert!(!builder.remove_file("key.pem"));
        assert_eq!(builder.get_digest(), before);
    }

    #[test]
    fn test_rehash_skips_files_removed_meanwhile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, b"secret").unwrap();

        let builder = builder();
        assert!(builder.add_file(&path, Some("key")));
        let before = builder.get_digest();

        // Read outside the lock, then the file stops being tracked
        let tracked = builder.tracked_paths().unwrap();
        fs::write(&path, b"rotated").unwrap();
        let live = builder.hash_tracked(&tracked);
        assert!(builder.remove_file("key"));
        builder.apply_file_hashes(&mut builder.state.lock(), live);

        let record = builder.record().unwrap();
        assert!(record.file_hashes.is_empty());
        assert_ne!(builder.get_digest(), before);
    }

    #[test]
    fn test_digest_while_state_is_in_use() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![7u8; 4 * 1024 * 1024]).unwrap();

        let builder = std::sync::Arc::new(builder());
        assert!(builder.add_file(&path, Some("big")));

        let hashing = {
            let builder = std::sync::Arc::clone(&builder);
            std::thread::spawn(move || builder.get_digest())
        };
        for i in 0..20 {
            builder.update_custom_field("tick", json!(i));
            assert_eq!(builder.statistics().file_count, 1);
        }

        let digest = hashing.join().unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(builder.record().unwrap().custom_data["tick"], json!(19));
    }

    #[test]
    fn test_add_missing_file_returns_false() {
        let builder = builder();
        assert!(!builder.add_file(Path::new("/definitely/not/here"), Some("x")));
        assert_eq!(builder.statistics().file_count, 0);
    }

    #[test]
    fn test_modified_file_changes_digest_inside_window() {
        let dir = TempDir::new().unwrap();
        let tracked = dir.path().join("tracked.txt");
        let other = dir.path().join("other.txt");
        fs::write(&tracked, b"version 1").unwrap();
        fs::write(&other, b"unchanged").unwrap();

        let builder = builder();
        assert!(builder.add_file(&tracked, Some("tracked")));
        assert!(builder.add_file(&other, Some("other")));

        let before = builder.get_digest();
        let other_hash = builder.record().unwrap().file_hashes["other"].clone();

        fs::write(&tracked, b"version 2").unwrap();
        let after = builder.get_digest();
        assert_ne!(before, after);

        let record = builder.record().unwrap();
        assert_eq!(record.file_hashes["other"], other_hash);
        assert_eq!(
            record.file_hashes["tracked"],
            HashAlgorithm::Sha256.digest_hex(b"version 2")
        );
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");
        let export = dir.path().join("identity.json");
        fs::write(&file, b"payload").unwrap();

        let original = builder();
        original.update_custom_field("channel", json!({"name": "test", "id": 7}));
        assert!(original.add_file(&file, Some("data")));
        let digest = original.get_digest();
        original.export(&export).unwrap();

        let restored = builder();
        assert_ne!(restored.get_digest(), digest);
        restored.import(&export).unwrap();

        assert_eq!(restored.get_digest(), digest);
        assert_eq!(restored.record(), original.record());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(&path, "not json").unwrap();

        let builder = builder();
        let digest = builder.get_digest();
        assert!(builder.import(&path).is_err());
        assert!(builder.import(&dir.path().join("missing.json")).is_err());
        assert_eq!(builder.get_digest(), digest);
    }

    #[test]
    fn test_import_without_optional_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(
            &path,
            r#"{
                "identity_hash": "abc",
                "creation_time": "2024-05-01T12:00:00.123456Z",
                "system_info": {},
                "file_hashes": {"a": "00"},
                "custom_data": {}
            }"#,
        )
        .unwrap();

        let builder = builder();
        builder.import(&path).unwrap();
        let record = builder.record().unwrap();
        assert_eq!(record.version, "1.0");
        assert!(record.file_paths.is_empty());
        assert_eq!(
            record.canonical_string(),
            r#"files:{"a":"00"}|created:2024-05-01T12:00:00.123456Z"#
        );
    }

    #[test]
    fn test_from_config_policy() {
        let dir = TempDir::new().unwrap();
        let identity_file = dir.path().join("me.id");

        // Nothing on disk, generation disabled
        let disabled = IdentityBuilder::from_config(&IdentityConfig {
            identity_file: Some(identity_file.clone()),
            auto_generate: false,
            ..Default::default()
        });
        assert_eq!(disabled.get_digest(), "");
        assert!(!disabled.statistics().has_identity);

        // Generated with system info
        let generated = IdentityBuilder::from_config(&IdentityConfig {
            identity_file: Some(identity_file.clone()),
            ..Default::default()
        });
        assert!(!generated.record().unwrap().system_info.is_empty());
        generated.export(&identity_file).unwrap();

        // Existing file is imported
        let loaded = IdentityBuilder::from_config(&IdentityConfig {
            identity_file: Some(identity_file),
            ..Default::default()
        });
        assert_eq!(loaded.get_digest(), generated.get_digest());
    }

    #[test]
    fn test_tracks_non_identity_file_under_alias() {
        let dir = TempDir::new().unwrap();
        let identity_file = dir.path().join("seed.bin");
        fs::write(&identity_file, b"seed").unwrap();

        let builder = IdentityBuilder::from_config(&IdentityConfig {
            identity_file: Some(identity_file),
            include_system_info: false,
            ..Default::default()
        });

        // Not a valid identity document, so a new identity tracks it instead
        let record = builder.record().unwrap();
        assert!(record.system_info.is_empty());
        assert_eq!(
            record.file_hashes[IDENTITY_FILE_ALIAS],
            HashAlgorithm::Sha256.digest_hex(b"seed")
        );
    }
}

//! Digest algorithms used for identity and file hashing.

use md5::Md5;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::warn;

const CHUNK_SIZE: usize = 8192;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
    /// Legacy 128-bit digest, kept for compatibility with older identities.
    Md5,
}

impl HashAlgorithm {
    /// Resolve an algorithm by name, falling back to SHA-256.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => HashAlgorithm::Sha256,
            "sha512" => HashAlgorithm::Sha512,
            "md5" => HashAlgorithm::Md5,
            other => {
                warn!("Unknown hash algorithm '{}', using sha256", other);
                HashAlgorithm::Sha256
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Md5 => "md5",
        }
    }

    /// Hex digest of `bytes`.
    pub fn digest_hex(&self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
            HashAlgorithm::Md5 => hex::encode(Md5::digest(bytes)),
        }
    }

    /// Hex digest of everything `reader` yields, read in fixed-size chunks.
    pub fn hash_reader<R: Read>(&self, reader: R) -> io::Result<String> {
        match self {
            HashAlgorithm::Sha256 => stream::<Sha256, R>(reader),
            HashAlgorithm::Sha512 => stream::<Sha512, R>(reader),
            HashAlgorithm::Md5 => stream::<Md5, R>(reader),
        }
    }

    pub fn hash_file(&self, path: &Path) -> io::Result<String> {
        self.hash_reader(File::open(path)?)
    }
}

fn stream<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

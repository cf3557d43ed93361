//! Integrity Hashing
//!
//! SHA256 content hashes for published firmware. Integrity only; there is
//! no signature or authenticity check.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::engine::error::StorageError;

/// Hex-encoded SHA256 of an in-memory payload
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Calculate SHA256 of a file without loading it whole
pub fn hash_file(path: &Path) -> Result<String, StorageError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expected hash
pub fn verify_file(path: &Path, expected: &str) -> Result<(), StorageError> {
    let actual = hash_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(StorageError::Corrupt(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

//! Hashing utilities for feature identity and artifact verification.
//!
//! This module provides:
//! - `ObjectHash`: A truncated 20-character hash used as a feature identity
//! - `ContentHash`: A full 64-character hash for artifact verification
//! - `hash_file()`: Single file hashing
//! - `hash_bytes()`: Arbitrary byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a unique object.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized value.
/// Identities are only compared within one compilation, so the truncation
/// never has to hold up across builds.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string, e.g., `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    let full = hex::encode(Sha256::digest(serialized.as_bytes()));
    Ok(ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string()))
  }
}

/// A full 64-character SHA256 hash for content verification.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing a file on disk.
#[derive(Debug, thiserror::Error)]
#[error("failed to read file {path}: {message}")]
pub struct FileHashError {
  pub path: String,
  pub message: String,
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA256 hash of the file.
pub fn hash_file(path: &Path) -> Result<ContentHash, FileHashError> {
  let read_err = |e: std::io::Error| FileHashError {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA256 hash.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[derive(Serialize)]
  struct Sample {
    name: &'static str,
    size: u32,
  }

  impl Hashable for Sample {}

  #[test]
  fn object_hash_is_truncated() {
    let hash = Sample { name: "a", size: 1 }.compute_hash().unwrap();
    assert_eq!(hash.0.len(), OBJ_HASH_PREFIX_LEN);
  }

  #[test]
  fn object_hash_is_deterministic() {
    let a = Sample { name: "a", size: 1 }.compute_hash().unwrap();
    let b = Sample { name: "a", size: 1 }.compute_hash().unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn object_hash_changes_with_content() {
    let a = Sample { name: "a", size: 1 }.compute_hash().unwrap();
    let b = Sample { name: "a", size: 2 }.compute_hash().unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn hash_file_matches_hash_bytes() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    let hash = hash_file(&file_path).unwrap();
    assert_eq!(hash.0.len(), 64);
    assert_eq!(hash, hash_bytes(b"hello world"));
  }

  #[test]
  fn hash_file_reports_missing_path() {
    let temp = tempdir().unwrap();
    let err = hash_file(&temp.path().join("nope")).unwrap_err();
    assert!(err.path.ends_with("nope"));
  }
}

//! # Partitioning
//!
//! Routes keyed rows to one of N output partitions. The hash is pinned (the
//! first eight bytes, big-endian, of the SHA-256 digest of the key's UTF-8
//! bytes) so every process, on every platform and after every restart, picks
//! the same partition for the same key. Replayed messages therefore land on
//! the same downstream queue as the original emission.
//!
//! ```rust
//! use stageweave::partitioning::{PartitionKey, partition_for};
//!
//! let key = PartitionKey::from("Jane Austen");
//! assert_eq!(partition_for(&key, 4), partition_for(&key, 4));
//! assert!(partition_for(&key, 4).unwrap() < 4);
//! assert_eq!(partition_for(&key, 0), None);
//! ```

use sha2::{Digest, Sha256};

/// Key that determines which partition handles a row.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PartitionKey(pub String);

impl PartitionKey {
  /// Creates a new partition key from a string.
  pub fn new(s: String) -> Self {
    Self(s)
  }

  /// Returns the key as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Stable 64-bit hash of the key.
  pub fn stable_hash(&self) -> u64 {
    stable_hash(&self.0)
  }
}

impl From<String> for PartitionKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<&str> for PartitionKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// First eight bytes (big-endian) of the SHA-256 digest of `key`.
pub fn stable_hash(key: &str) -> u64 {
  let digest = Sha256::digest(key.as_bytes());
  let mut prefix = [0u8; 8];
  prefix.copy_from_slice(&digest[..8]);
  u64::from_be_bytes(prefix)
}

/// Partition index for `key` among `partitions`, or `None` when there are no
/// partitions.
pub fn partition_for(key: &PartitionKey, partitions: usize) -> Option<usize> {
  if partitions == 0 {
    return None;
  }
  Some((key.stable_hash() % partitions as u64) as usize)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stable_hash_is_pinned_to_sha256_prefix() {
    assert_eq!(stable_hash(""), 0xe3b0_c442_98fc_1c14);
    assert_eq!(stable_hash("abc"), 0xba78_16bf_8f01_cfea);
  }

  #[test]
  fn partition_is_hash_modulo_count() {
    let key = PartitionKey::from("abc");
    assert_eq!(
      partition_for(&key, 3),
      Some((0xba78_16bf_8f01_cfea_u64 % 3) as usize)
    );
    assert_eq!(partition_for(&key, 1), Some(0));
    assert_eq!(partition_for(&key, 0), None);
  }

  #[test]
  fn partitions_spread_over_all_outputs() {
    let mut seen = [false; 4];
    for i in 0..200 {
      let key = PartitionKey::new(format!("author_{i}"));
      seen[partition_for(&key, 4).unwrap()] = true;
    }
    assert!(seen.iter().all(|hit| *hit));
  }
}

//! SHA-256 content hashing and Merkle roots.
//!
//! Every identity in the system (transaction ids, block hashes,
//! payload digests) is a SHA2-256 multihash so values print and
//! serialize uniformly across the chain, the message bus and the
//! stat snapshots.

use multihash_codetable::{Code, MultihashDigest, Sha2_256};
use multihash_derive::Hasher;

/// The multihash type used throughout the chain (SHA2-256, max digest size 64).
pub type Multihash = multihash::Multihash<64>;

/// Hashes an arbitrary byte string into a SHA2-256 multihash.
pub fn sha256(bytes: &[u8]) -> Multihash {
  let mut hasher = Sha2_256::default();
  hasher.update(bytes);
  Code::Sha2_256.wrap(hasher.finalize()).unwrap()
}

/// The all-zero digest used as the parent of genesis blocks.
pub fn zero_hash() -> Multihash {
  Code::Sha2_256.wrap(&[0u8; 32]).unwrap()
}

/// Computes the Merkle root of a list of payload hashes.
///
/// Binary tree, SHA-256 at each level, the last node is duplicated
/// on odd counts. The root of a single leaf is the leaf itself,
/// which keeps single-transaction blocks cheap while leaving the
/// structure ready for batched payloads.
pub fn merkle_root(leaves: &[Multihash]) -> Multihash {
  match leaves.len() {
    0 => sha256(&[]),
    1 => leaves[0],
    _ => {
      let mut level: Vec<Multihash> = leaves.to_vec();
      while level.len() > 1 {
        level = level
          .chunks(2)
          .map(|pair| {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let mut joined = left.digest().to_vec();
            joined.extend_from_slice(right.digest());
            sha256(&joined)
          })
          .collect();
      }
      level[0]
    }
  }
}

//! Binary Merkle tree over SHA-256 leaf hashes.
//!
//! Canonical rules, fixed for cross-implementation reproducibility:
//!
//! - Leaves are hex-encoded SHA-256 digests sorted ascending by hex value.
//! - Parents hash the concatenation of the two child digests' raw bytes.
//! - A level with an odd node count duplicates its last node (the last node
//!   is paired with itself). The alternative carry-up rule is NOT used.
//! - An empty leaf set has the root `SHA-256("")`.
//! - A single leaf is its own root.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from Merkle tree construction.
#[derive(Debug, Error)]
pub enum MerkleError {
    /// A leaf was not a valid hex-encoded SHA-256 digest.
    #[error("invalid merkle leaf {leaf:?}")]
    InvalidLeaf {
        /// The offending leaf value.
        leaf: String,
    },
}

/// Compute the Merkle root of a set of hex-encoded SHA-256 digests.
///
/// # Errors
///
/// Returns [`MerkleError::InvalidLeaf`] when a leaf is not valid hex or not
/// 32 bytes long.
pub fn merkle_root(leaves: &[String]) -> Result<String, MerkleError> {
    if leaves.is_empty() {
        return Ok(hex::encode(Sha256::digest([])));
    }

    let mut sorted: Vec<&String> = leaves.iter().collect();
    sorted.sort();

    let mut level: Vec<Vec<u8>> = Vec::with_capacity(sorted.len());
    for leaf in sorted {
        let bytes = hex::decode(leaf).map_err(|_| MerkleError::InvalidLeaf { leaf: leaf.clone() })?;
        if bytes.len() != 32 {
            return Err(MerkleError::InvalidLeaf { leaf: leaf.clone() });
        }
        level.push(bytes);
    }

    while level.len() > 1 {
        let mut parents = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            // Odd node count: the last node is paired with itself.
            let right = pair.get(1).unwrap_or(left);
            let mut hasher = Sha256::new();
            hasher.update(left);
            hasher.update(right);
            parents.push(hasher.finalize().to_vec());
        }
        level = parents;
    }

    Ok(hex::encode(&level[0]))
}

//! Evidence trail: chained hash records, Merkle bundles, and optional
//! record signatures.
//!
//! # Hash chain
//!
//! Each successful capture appends a record whose chain hash links it to
//! its predecessor; tampering with any historical snapshot breaks the chain
//! from that index onward. See [`chain`] for the exact construction.
//!
//! # Bundles
//!
//! A finalized file set is summarized by a path-sorted SHA-256 manifest and
//! a Merkle root for compact third-party verification. The tree rules are
//! fixed in [`merkle`]; the odd-leaf rule is duplicate-last-leaf.
//!
//! # Signatures
//!
//! A detached Ed25519 signature over the chain hash may be stored with each
//! record for non-repudiation. Integrity errors are fatal to verification
//! and are never auto-repaired.

pub mod bundle;
pub mod chain;
pub mod merkle;
pub mod sign;

pub use bundle::{BundleError, BundleFile, BundleVerdict, EvidenceBundle, BUNDLE_SCHEMA_VERSION};
pub use chain::{
    ChainError, ChainVerdict, Checkpoint, EvidenceChain, HashRecord, GENESIS_PREVIOUS_HASH,
};
pub use merkle::{merkle_root, MerkleError};
pub use sign::{
    verify_record_signature, RecordSignature, RecordSigner, SignError, SIGNATURE_ALGORITHM,
};

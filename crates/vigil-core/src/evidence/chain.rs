//! Chained hash records over the snapshot store.
//!
//! Every successful capture appends one immutable record linking the
//! snapshot's hash to its predecessor:
//!
//! ```text
//! snapshot_hash = SHA-256(JCS(snapshot))
//! chain_hash    = SHA-256(hex(previous_chain_hash) ":" hex(snapshot_hash))
//! ```
//!
//! The genesis record's previous hash is the 64-zero hex string. Snapshot
//! metadata is canonicalized with JCS so the hash is independent of field
//! ordering. Appends run under an exclusive file lock: a single logical
//! writer per ledger is a protocol requirement, and concurrent writers are
//! a violation, not a supported path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::evidence::sign::{self, RecordSignature, RecordSigner};
use crate::lockfile::{self, LockError};
use crate::store::{self, Snapshot, SnapshotStore, StoreError};

/// Previous-hash value of the genesis record.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// How long an append waits for the ledger lock before failing.
const LEDGER_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// One append-only entry in the evidence ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    /// Strictly increasing record index, genesis is 0.
    pub sequence_index: u64,

    /// Snapshot file path relative to the data root.
    pub snapshot_path: String,

    /// SHA-256 of the canonicalized snapshot.
    pub snapshot_hash: String,

    /// Chain hash of the predecessor record.
    pub previous_hash: String,

    /// Chain hash of this record.
    pub chain_hash: String,

    /// Capture time copied from the snapshot.
    pub captured_at_utc: DateTime<Utc>,

    /// Optional detached signature over `chain_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<RecordSignature>,
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Persistence layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Snapshot canonicalization failed.
    #[error("failed to canonicalize snapshot: {0}")]
    Canonicalize(#[source] serde_json::Error),

    /// A record with this index already exists; the ledger is append-only.
    #[error("record {index} already exists in the ledger")]
    DuplicateRecord {
        /// The colliding sequence index.
        index: u64,
    },
}

/// Verification verdict for a ledger.
///
/// The first mismatch marks that index and every later index as failed;
/// verification never repairs anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    /// Every checked record verified.
    Pass {
        /// Number of records checked.
        records: u64,
    },

    /// Verification failed from `first_bad_index` onward.
    Fail {
        /// First diverging record index.
        first_bad_index: u64,
        /// Machine-readable failure reason.
        reason: String,
        /// Records that verified before the divergence.
        verified: u64,
    },
}

impl ChainVerdict {
    /// Whether the verdict is a pass.
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }
}

/// Trusted resume point for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Index of the trusted record.
    pub index: u64,

    /// Chain hash of the trusted record.
    pub chain_hash: String,
}

/// Compute the canonical snapshot hash.
///
/// # Errors
///
/// Returns [`ChainError::Canonicalize`] when JCS encoding fails.
pub fn snapshot_hash(snapshot: &Snapshot) -> Result<String, ChainError> {
    let canonical = serde_jcs::to_vec(snapshot).map_err(ChainError::Canonicalize)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Compute a chain hash from hex-encoded predecessor and snapshot hashes.
#[must_use]
pub fn chain_hash(previous: &str, snapshot_hash: &str) -> String {
    hex::encode(Sha256::digest(format!("{previous}:{snapshot_hash}").as_bytes()))
}

/// Append-only store of chained hash records, one immutable file per
/// record.
#[derive(Debug, Clone)]
pub struct EvidenceChain {
    ledger_dir: PathBuf,
    lock_path: PathBuf,
}

impl EvidenceChain {
    /// Open a ledger rooted at `ledger_dir`, serialized by `lock_path`.
    pub fn new(ledger_dir: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            ledger_dir: ledger_dir.into(),
            lock_path: lock_path.into(),
        }
    }

    fn record_path(&self, index: u64) -> PathBuf {
        self.ledger_dir.join(format!("record_{index:08}.json"))
    }

    /// Load all records sorted by sequence index.
    ///
    /// # Errors
    ///
    /// Returns `ChainError` when a record file cannot be read or parsed.
    pub fn records(&self) -> Result<Vec<HashRecord>, ChainError> {
        let entries = match std::fs::read_dir(&self.ledger_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::Io {
                    path: self.ledger_dir.clone(),
                    source: err,
                }
                .into())
            },
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("record_") || !name.ends_with(".json") {
                continue;
            }
            if let Some(record) = store::read_json::<HashRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.sequence_index);
        Ok(records)
    }

    /// The highest-index record, if any.
    ///
    /// # Errors
    ///
    /// Returns `ChainError` on unreadable records.
    pub fn head(&self) -> Result<Option<HashRecord>, ChainError> {
        Ok(self.records()?.pop())
    }

    /// Append a record for `snapshot`, stored at `snapshot_path` relative
    /// to the data root. Optionally signs the chain hash.
    ///
    /// Runs under the ledger's exclusive file lock.
    ///
    /// # Errors
    ///
    /// Returns `ChainError` on lock, hash, or persistence failures.
    pub fn append(
        &self,
        snapshot: &Snapshot,
        snapshot_path: &str,
        signer: Option<&RecordSigner>,
    ) -> Result<HashRecord, ChainError> {
        let _guard = lockfile::acquire_lock(&self.lock_path, LEDGER_LOCK_TIMEOUT)?;

        let (previous, sequence_index) = match self.head()? {
            Some(head) => (head.chain_hash, head.sequence_index + 1),
            None => (GENESIS_PREVIOUS_HASH.to_string(), 0),
        };

        let snapshot_hash = snapshot_hash(snapshot)?;
        let chain_hash = chain_hash(&previous, &snapshot_hash);
        let signature = signer.map(|signer| signer.sign_chain_hash(&chain_hash));

        let record = HashRecord {
            sequence_index,
            snapshot_path: snapshot_path.to_string(),
            snapshot_hash,
            previous_hash: previous,
            chain_hash,
            captured_at_utc: snapshot.captured_at_utc,
            signature,
        };

        let path = self.record_path(sequence_index);
        if path.exists() {
            return Err(ChainError::DuplicateRecord {
                index: sequence_index,
            });
        }
        store::write_json_atomic(&path, &record)?;
        Ok(record)
    }

    /// Verify the ledger by replaying it from genesis, or from a trusted
    /// checkpoint when one is supplied.
    ///
    /// Recomputes every snapshot hash from the snapshot file under
    /// `data_root` and every chain hash from its predecessor. The first
    /// mismatch fails that index and all later indices.
    ///
    /// # Errors
    ///
    /// Returns `ChainError` only for ledger-level I/O problems; integrity
    /// divergences are reported through [`ChainVerdict::Fail`].
    pub fn verify(
        &self,
        data_root: &Path,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<ChainVerdict, ChainError> {
        let records = self.records()?;

        let (mut expected_previous, start_index) = match checkpoint {
            Some(checkpoint) => (checkpoint.chain_hash.clone(), checkpoint.index + 1),
            None => (GENESIS_PREVIOUS_HASH.to_string(), 0),
        };

        let mut expected_index = start_index;
        let mut verified: u64 = 0;

        for record in records
            .iter()
            .filter(|record| record.sequence_index >= start_index)
        {
            let fail = |reason: String| ChainVerdict::Fail {
                first_bad_index: record.sequence_index,
                reason,
                verified,
            };

            if record.sequence_index != expected_index {
                return Ok(fail(format!(
                    "sequence_gap expected={expected_index} got={}",
                    record.sequence_index
                )));
            }
            if record.previous_hash != expected_previous {
                return Ok(fail("chain_link_mismatch".to_string()));
            }

            let snapshot_file = data_root.join(&record.snapshot_path);
            let snapshot = match SnapshotStore::load(&snapshot_file) {
                Ok(snapshot) => snapshot,
                Err(err) => return Ok(fail(format!("snapshot_unreadable:{err}"))),
            };
            let recomputed_snapshot = snapshot_hash(&snapshot)?;
            if recomputed_snapshot != record.snapshot_hash {
                return Ok(fail("snapshot_hash_mismatch".to_string()));
            }

            let recomputed_chain = chain_hash(&expected_previous, &recomputed_snapshot);
            if recomputed_chain != record.chain_hash {
                return Ok(fail("chain_hash_mismatch".to_string()));
            }

            if let Some(signature) = &record.signature {
                if sign::verify_record_signature(signature, &record.chain_hash).is_err() {
                    return Ok(fail("signature_invalid".to_string()));
                }
            }

            expected_previous = record.chain_hash.clone();
            expected_index += 1;
            verified += 1;
        }

        Ok(ChainVerdict::Pass { records: verified })
    }
}

//! Optional detached Ed25519 signatures over chain hashes.
//!
//! A signature stored alongside a hash record provides non-repudiation: the
//! record was produced by the holder of the signing key. Verification
//! requires the paired public key and is fatal on mismatch; there is no
//! retry path for integrity errors.

use std::path::Path;

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store;

/// Signature algorithm label stored in records.
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Detached signature stored alongside a hash record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSignature {
    /// Signature algorithm; currently always `"ed25519"`.
    pub algorithm: String,

    /// Hex-encoded 32-byte public key.
    pub public_key: String,

    /// Hex-encoded 64-byte signature over the chain hash string.
    pub signature: String,
}

/// Errors from signing and verification.
#[derive(Debug, Error)]
pub enum SignError {
    /// Key material was malformed.
    #[error("invalid signing key material: {reason}")]
    InvalidKey {
        /// What was wrong with the key.
        reason: String,
    },

    /// Stored signature bytes were malformed.
    #[error("malformed signature: {reason}")]
    MalformedSignature {
        /// What was wrong with the signature encoding.
        reason: String,
    },

    /// The signature algorithm is not supported.
    #[error("unsupported signature algorithm {algorithm:?}")]
    UnsupportedAlgorithm {
        /// The unrecognized algorithm label.
        algorithm: String,
    },

    /// Signature did not verify against the chain hash.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Key file I/O failed.
    #[error("key file error at {path}: {source}")]
    Io {
        /// Path of the key file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Signs chain hashes with a persistent Ed25519 key.
pub struct RecordSigner {
    signing_key: SigningKey,
}

impl std::fmt::Debug for RecordSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSigner")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl RecordSigner {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a signer from a hex-encoded 32-byte secret key.
    ///
    /// # Errors
    ///
    /// Returns [`SignError::InvalidKey`] on malformed input.
    pub fn from_hex(secret_hex: &str) -> Result<Self, SignError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|err| SignError::InvalidKey {
            reason: err.to_string(),
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| SignError::InvalidKey {
            reason: "secret key must be 32 bytes".to_string(),
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Load a signer from a key file, generating and persisting a new key
    /// when the file does not exist. The key file holds the hex-encoded
    /// 32-byte secret and is created with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns `SignError` when the file exists but is malformed, or on
    /// filesystem errors.
    pub fn load_or_generate(path: &Path) -> Result<Self, SignError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_hex(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let signer = Self::generate();
                let secret_hex = hex::encode(signer.signing_key.to_bytes());
                store::write_atomic(path, secret_hex.as_bytes()).map_err(|store_err| {
                    SignError::Io {
                        path: path.to_path_buf(),
                        source: std::io::Error::other(store_err.to_string()),
                    }
                })?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o600);
                    if let Err(err) = std::fs::set_permissions(path, perms) {
                        tracing::warn!(path = %path.display(), error = %err, "failed to set key file permissions");
                    }
                }
                Ok(signer)
            },
            Err(source) => Err(SignError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Hex-encoded public key of this signer.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Produce a detached signature over a chain hash string.
    #[must_use]
    pub fn sign_chain_hash(&self, chain_hash: &str) -> RecordSignature {
        let signature = self.signing_key.sign(chain_hash.as_bytes());
        RecordSignature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// Verify a detached signature against a chain hash string.
///
/// # Errors
///
/// Returns `SignError` when the algorithm is unsupported, the key or
/// signature bytes are malformed, or verification fails.
pub fn verify_record_signature(
    signature: &RecordSignature,
    chain_hash: &str,
) -> Result<(), SignError> {
    if signature.algorithm != SIGNATURE_ALGORITHM {
        return Err(SignError::UnsupportedAlgorithm {
            algorithm: signature.algorithm.clone(),
        });
    }

    let key_bytes = hex::decode(&signature.public_key).map_err(|err| SignError::InvalidKey {
        reason: err.to_string(),
    })?;
    let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| SignError::InvalidKey {
        reason: "public key must be 32 bytes".to_string(),
    })?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|err| SignError::InvalidKey {
            reason: err.to_string(),
        })?;

    let sig_bytes = hex::decode(&signature.signature).map_err(|err| {
        SignError::MalformedSignature {
            reason: err.to_string(),
        }
    })?;
    let parsed = Signature::from_slice(&sig_bytes).map_err(|err| SignError::MalformedSignature {
        reason: err.to_string(),
    })?;

    verifying_key
        .verify_strict(chain_hash.as_bytes(), &parsed)
        .map_err(|_| SignError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let signer = RecordSigner::generate();
        let chain_hash = "ab".repeat(32);
        let signature = signer.sign_chain_hash(&chain_hash);
        verify_record_signature(&signature, &chain_hash).unwrap();
    }

    #[test]
    fn verification_fails_for_wrong_hash() {
        let signer = RecordSigner::generate();
        let signature = signer.sign_chain_hash(&"ab".repeat(32));
        let result = verify_record_signature(&signature, &"cd".repeat(32));
        assert!(matches!(result, Err(SignError::VerificationFailed)));
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let signer = RecordSigner::generate();
        let mut signature = signer.sign_chain_hash(&"ab".repeat(32));
        signature.algorithm = "rsa".to_string();
        let result = verify_record_signature(&signature, &"ab".repeat(32));
        assert!(matches!(result, Err(SignError::UnsupportedAlgorithm { .. })));
    }

    #[test]
    fn key_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signer.key");

        let first = RecordSigner::load_or_generate(&path).unwrap();
        let second = RecordSigner::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }
}

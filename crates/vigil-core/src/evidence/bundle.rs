//! Evidence bundles for third-party verification.
//!
//! A bundle summarizes a closed, finalized file set: per-file SHA-256
//! digests in a path-sorted manifest plus a Merkle root over the digests
//! (see [`crate::evidence::merkle`] for the canonical tree rules).
//! Assembly is idempotent on an unchanged file set: the manifest and root
//! come out identical across runs.
//!
//! Verification recomputes every digest and the root; any missing file,
//! extra file, or mismatch is a FAIL listing each divergence.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::evidence::merkle::{self, MerkleError};
use crate::store;

/// Bundle wire format version.
pub const BUNDLE_SCHEMA_VERSION: &str = "1.0";

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    /// File path relative to the bundle base directory.
    pub path: String,

    /// Hex-encoded SHA-256 of the file contents.
    pub sha256: String,
}

/// Evidence bundle document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    /// Wire format version.
    pub schema_version: String,

    /// Assembly time.
    pub created_at_utc: DateTime<Utc>,

    /// Number of manifest entries.
    pub file_count: usize,

    /// Path-sorted manifest.
    pub files: Vec<BundleFile>,

    /// Merkle root over the manifest digests.
    pub merkle_root_sha256: String,
}

/// Errors from bundle operations.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Filesystem failure.
    #[error("bundle I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Bundle document could not be parsed.
    #[error("bundle parse error at {path}: {source}")]
    Parse {
        /// Path of the bundle document.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Merkle construction failed.
    #[error(transparent)]
    Merkle(#[from] MerkleError),

    /// Persistence failure while writing the bundle.
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

/// Verification verdict for a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleVerdict {
    /// Every file and the root matched.
    Pass,

    /// One or more divergences, in the order discovered.
    Fail(Vec<String>),
}

impl BundleVerdict {
    /// Whether the verdict is a pass.
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Streaming SHA-256 of a file.
///
/// # Errors
///
/// Returns `BundleError::Io` when the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, BundleError> {
    let mut file = std::fs::File::open(path).map_err(|source| BundleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Collect regular files under `dir` as sorted relative paths. Symlinks are
/// skipped.
fn walk_files(base: &Path) -> Result<Vec<String>, BundleError> {
    fn visit(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), BundleError> {
        let entries = std::fs::read_dir(dir).map_err(|source| BundleError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_symlink() {
                continue;
            }
            if path.is_dir() {
                visit(base, &path, out)?;
            } else if path.is_file() {
                let relative = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push(relative);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    visit(base, base, &mut files)?;
    files.sort();
    Ok(files)
}

/// Assemble a bundle over every regular file under `input_dir`.
///
/// # Errors
///
/// Returns `BundleError` on filesystem or Merkle failures.
pub fn assemble(input_dir: &Path) -> Result<EvidenceBundle, BundleError> {
    let mut files = Vec::new();
    let mut hashes = Vec::new();
    for relative in walk_files(input_dir)? {
        let digest = sha256_file(&input_dir.join(&relative))?;
        hashes.push(digest.clone());
        files.push(BundleFile {
            path: relative,
            sha256: digest,
        });
    }

    Ok(EvidenceBundle {
        schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
        created_at_utc: Utc::now(),
        file_count: files.len(),
        files,
        merkle_root_sha256: merkle::merkle_root(&hashes)?,
    })
}

/// Write a bundle document atomically.
///
/// # Errors
///
/// Returns `BundleError` on persistence failures.
pub fn write(bundle: &EvidenceBundle, path: &Path) -> Result<(), BundleError> {
    store::write_json_atomic(path, bundle)?;
    Ok(())
}

/// Load a bundle document.
///
/// # Errors
///
/// Returns `BundleError` when the file is missing or malformed.
pub fn load(path: &Path) -> Result<EvidenceBundle, BundleError> {
    let content = std::fs::read_to_string(path).map_err(|source| BundleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| BundleError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Verify a bundle against the files under `base_dir`.
///
/// Recomputes per-file digests and the Merkle root. PASS requires every
/// manifest file present and matching, no extra files, a consistent
/// `file_count`, and an exactly matching root. The bundle document itself
/// is excluded from the extra-file scan when it lives under `base_dir`.
///
/// # Errors
///
/// Returns `BundleError` only when the bundle document itself cannot be
/// read; integrity divergences are reported through [`BundleVerdict::Fail`].
pub fn verify(bundle_path: &Path, base_dir: &Path) -> Result<BundleVerdict, BundleError> {
    let bundle = load(bundle_path)?;
    let mut errors = Vec::new();
    let mut recomputed = Vec::new();

    for entry in &bundle.files {
        let path = base_dir.join(&entry.path);
        if !path.is_file() {
            errors.push(format!("missing_file:{}", entry.path));
            continue;
        }
        match sha256_file(&path) {
            Ok(digest) => {
                if digest != entry.sha256 {
                    errors.push(format!("hash_mismatch:{}", entry.path));
                }
                recomputed.push(digest);
            },
            Err(err) => errors.push(format!("unreadable_file:{} ({err})", entry.path)),
        }
    }

    if bundle.files.len() != bundle.file_count {
        errors.push("file_count_mismatch".to_string());
    }

    let bundle_relative = bundle_path
        .canonicalize()
        .ok()
        .zip(base_dir.canonicalize().ok())
        .and_then(|(bundle, base)| {
            bundle
                .strip_prefix(base)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        });
    let manifest: std::collections::BTreeSet<&str> =
        bundle.files.iter().map(|entry| entry.path.as_str()).collect();
    for on_disk in walk_files(base_dir)? {
        if bundle_relative.as_deref() == Some(on_disk.as_str()) {
            continue;
        }
        if !manifest.contains(on_disk.as_str()) {
            errors.push(format!("extra_file:{on_disk}"));
        }
    }

    let root = merkle::merkle_root(&recomputed)?;
    if root != bundle.merkle_root_sha256 {
        errors.push("merkle_root_mismatch".to_string());
    }

    if errors.is_empty() {
        Ok(BundleVerdict::Pass)
    } else {
        Ok(BundleVerdict::Fail(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_files(dir: &Path) {
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.json"), b"{\"a\":1}").unwrap();
        std::fs::write(dir.join("b.json"), b"{\"b\":2}").unwrap();
        std::fs::write(dir.join("nested/c.json"), b"{\"c\":3}").unwrap();
    }

    #[test]
    fn assembly_is_idempotent_on_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_files(dir.path());

        let first = assemble(dir.path()).unwrap();
        let second = assemble(dir.path()).unwrap();
        assert_eq!(first.files, second.files);
        assert_eq!(first.merkle_root_sha256, second.merkle_root_sha256);
        assert_eq!(first.file_count, 3);
    }

    #[test]
    fn manifest_is_sorted_by_path() {
        let dir = tempfile::tempdir().unwrap();
        seed_files(dir.path());

        let bundle = assemble(dir.path()).unwrap();
        let paths: Vec<&str> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort_unstable();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn untampered_bundle_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("evidence");
        std::fs::create_dir_all(&base).unwrap();
        seed_files(&base);

        let bundle = assemble(&base).unwrap();
        let bundle_path = dir.path().join("bundle.json");
        write(&bundle, &bundle_path).unwrap();

        assert_eq!(verify(&bundle_path, &base).unwrap(), BundleVerdict::Pass);
    }

    #[test]
    fn missing_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("evidence");
        std::fs::create_dir_all(&base).unwrap();
        seed_files(&base);

        let bundle = assemble(&base).unwrap();
        let bundle_path = dir.path().join("bundle.json");
        write(&bundle, &bundle_path).unwrap();

        std::fs::remove_file(base.join("b.json")).unwrap();
        match verify(&bundle_path, &base).unwrap() {
            BundleVerdict::Fail(errors) => {
                assert!(errors.iter().any(|e| e == "missing_file:b.json"));
                assert!(errors.iter().any(|e| e == "merkle_root_mismatch"));
            },
            BundleVerdict::Pass => panic!("missing file must fail"),
        }
    }

    #[test]
    fn altered_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("evidence");
        std::fs::create_dir_all(&base).unwrap();
        seed_files(&base);

        let bundle = assemble(&base).unwrap();
        let bundle_path = dir.path().join("bundle.json");
        write(&bundle, &bundle_path).unwrap();

        std::fs::write(base.join("a.json"), b"{\"a\":999}").unwrap();
        match verify(&bundle_path, &base).unwrap() {
            BundleVerdict::Fail(errors) => {
                assert!(errors.iter().any(|e| e == "hash_mismatch:a.json"));
                assert!(errors.iter().any(|e| e == "merkle_root_mismatch"));
            },
            BundleVerdict::Pass => panic!("altered file must fail"),
        }
    }

    #[test]
    fn extra_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("evidence");
        std::fs::create_dir_all(&base).unwrap();
        seed_files(&base);

        let bundle = assemble(&base).unwrap();
        let bundle_path = dir.path().join("bundle.json");
        write(&bundle, &bundle_path).unwrap();

        std::fs::write(base.join("smuggled.json"), b"{}").unwrap();
        match verify(&bundle_path, &base).unwrap() {
            BundleVerdict::Fail(errors) => {
                assert!(errors.iter().any(|e| e == "extra_file:smuggled.json"));
            },
            BundleVerdict::Pass => panic!("extra file must fail"),
        }
    }

    #[test]
    fn empty_directory_has_deterministic_root() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = assemble(dir.path()).unwrap();
        assert_eq!(bundle.file_count, 0);
        assert_eq!(
            bundle.merkle_root_sha256,
            hex::encode(Sha256::digest([]))
        );
    }
}

//! `vigil verify-chain` and `vigil verify-bundle`.
//!
//! Verification output is machine-readable: one `verification=PASS|FAIL`
//! line followed by the first point of divergence on failure.

use std::path::Path;

use vigil_core::evidence::bundle::{self, BundleVerdict};
use vigil_core::evidence::chain::{ChainVerdict, Checkpoint, EvidenceChain};
use vigil_core::store::Layout;

use crate::{EXIT_FAIL, EXIT_USAGE};

fn parse_checkpoint(raw: &str) -> Option<Checkpoint> {
    let (index, chain_hash) = raw.split_once(':')?;
    let index = index.parse::<u64>().ok()?;
    if chain_hash.len() != 64 || !chain_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(Checkpoint {
        index,
        chain_hash: chain_hash.to_ascii_lowercase(),
    })
}

/// Replay and verify the evidence chain.
pub fn run_chain(data_dir: &Path, from_checkpoint: Option<&str>) -> anyhow::Result<u8> {
    let checkpoint = match from_checkpoint {
        Some(raw) => match parse_checkpoint(raw) {
            Some(checkpoint) => Some(checkpoint),
            None => {
                eprintln!("invalid checkpoint {raw:?}, expected INDEX:HASH");
                return Ok(EXIT_USAGE);
            },
        },
        None => None,
    };

    let layout = Layout::new(data_dir);
    let chain = EvidenceChain::new(layout.ledger_dir(), layout.ledger_lock_path());
    let verdict = chain.verify(layout.root(), checkpoint.as_ref())?;

    match verdict {
        ChainVerdict::Pass { records } => {
            println!("verification=PASS");
            println!("records={records}");
            Ok(0)
        },
        ChainVerdict::Fail {
            first_bad_index,
            reason,
            verified,
        } => {
            println!("verification=FAIL");
            println!("first_bad_index={first_bad_index}");
            println!("reason={reason}");
            println!("verified_before_divergence={verified}");
            Ok(EXIT_FAIL)
        },
    }
}

/// Verify an evidence bundle against its base directory.
pub fn run_bundle(bundle_path: &Path, base_dir: &Path) -> anyhow::Result<u8> {
    let verdict = bundle::verify(bundle_path, base_dir)?;
    match verdict {
        BundleVerdict::Pass => {
            println!("verification=PASS");
            Ok(0)
        },
        BundleVerdict::Fail(errors) => {
            println!("verification=FAIL");
            for error in errors {
                println!("{error}");
            }
            Ok(EXIT_FAIL)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_parses_index_and_hash() {
        let checkpoint = parse_checkpoint(&format!("12:{}", "ab".repeat(32))).unwrap();
        assert_eq!(checkpoint.index, 12);
        assert_eq!(checkpoint.chain_hash, "ab".repeat(32));
    }

    #[test]
    fn malformed_checkpoints_are_rejected() {
        assert!(parse_checkpoint("12").is_none());
        assert!(parse_checkpoint("x:abcd").is_none());
        assert!(parse_checkpoint(&format!("3:{}", "zz".repeat(32))).is_none());
        assert!(parse_checkpoint("3:abcd").is_none());
    }
}

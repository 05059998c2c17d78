//! `vigil bundle` - assemble an evidence bundle.

use std::path::Path;

use anyhow::Context;
use vigil_core::evidence::bundle;

/// Assemble a bundle over `input_dir` and write it to `output`.
pub fn run(input_dir: &Path, output: &Path) -> anyhow::Result<u8> {
    let assembled = bundle::assemble(input_dir)
        .with_context(|| format!("indexing {}", input_dir.display()))?;
    bundle::write(&assembled, output)
        .with_context(|| format!("writing bundle to {}", output.display()))?;

    println!("bundle_created={}", output.display());
    println!("file_count={}", assembled.file_count);
    println!("merkle_root_sha256={}", assembled.merkle_root_sha256);
    Ok(0)
}

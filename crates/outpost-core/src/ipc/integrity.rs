use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash of the running executable. Service and helper ship as one binary, so
/// a helper presenting a different hash is not ours.
pub fn current_binary_hash() -> Result<String> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    file_sha256(&exe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(file_sha256(Path::new("/nonexistent/outpost")).is_err());
    }
}

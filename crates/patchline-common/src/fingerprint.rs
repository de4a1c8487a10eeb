//! Content fingerprints used to detect drift between a change set and the
//! tree it was written against.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex-encoded SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Fingerprint of a file's current contents.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(fingerprint(&bytes))
}

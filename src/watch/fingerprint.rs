use crate::util::sha256_hex;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// SHA-256 of a file's current contents.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

/// Tracks fingerprints across scans so only settled files are acted on.
///
/// A file counts as stable once two consecutive scans saw the same hash; a
/// file still being written changes between scans and is held back.
#[derive(Debug, Default)]
pub struct FingerprintTracker {
    last: BTreeMap<PathBuf, String>,
}

impl FingerprintTracker {
    /// Record a scan and return the files whose hash matched the previous one.
    pub fn observe(&mut self, scan: BTreeMap<PathBuf, String>) -> Vec<(PathBuf, String)> {
        let stable = scan
            .iter()
            .filter(|(path, hash)| self.last.get(*path) == Some(*hash))
            .map(|(path, hash)| (path.clone(), hash.clone()))
            .collect();
        self.last = scan;
        stable
    }
}

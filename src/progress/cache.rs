use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Modification-time cache keyed by path.
///
/// Readers only re-parse an engine artifact when its timestamp moved since
/// the previous poll.
#[derive(Debug, Default)]
pub struct ModifiedCache {
    seen: DashMap<PathBuf, SystemTime>,
}

impl ModifiedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `path` is a file whose timestamp differs from the cached one.
    /// The new timestamp is recorded. Missing files are never modified.
    pub fn is_modified(&self, path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(path) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        let Ok(modified) = metadata.modified() else {
            return false;
        };

        match self.seen.insert(path.to_path_buf(), modified) {
            Some(previous) => previous != modified,
            None => true,
        }
    }

    pub fn forget(&self, path: &Path) {
        self.seen.remove(path);
    }
}

//! Progress of vector collection migrations.
//!
//! Collection tasks push names as they complete; the progress monitor
//! drains them into append-only lists.

use crossbeam::queue::SegQueue;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default)]
pub struct VectorProgress {
    completed: SegQueue<String>,
    failed: SegQueue<String>,
}

impl VectorProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_completed(&self, collection: impl Into<String>) {
        self.completed.push(collection.into());
    }

    pub fn add_failed(&self, collection: impl Into<String>) {
        self.failed.push(collection.into());
    }

    /// Append queued names to the success and failure lists
    pub fn flush(&self, success_file: &Path, failed_file: &Path) {
        drain_to(&self.completed, success_file);
        drain_to(&self.failed, failed_file);
    }

    pub fn pending(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

fn drain_to(queue: &SegQueue<String>, path: &Path) {
    let mut names = Vec::with_capacity(queue.len());
    while let Some(name) = queue.pop() {
        names.push(name);
    }
    if names.is_empty() {
        return;
    }

    if let Err(e) = append_lines(path, &names) {
        warn!(path = %path.display(), error = %e, "Failed to write collection progress, will retry");
        for name in names {
            queue.push(name);
        }
    }
}

fn append_lines(path: &Path, names: &[String]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut contents = String::new();
    for name in names {
        contents.push_str(name);
        contents.push('\n');
    }
    file.write_all(contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_flush_appends_and_drains() {
        let dir = TempDir::new().unwrap();
        let success = dir.path().join("success.txt");
        let failed = dir.path().join("failed.txt");
        let progress = VectorProgress::new();

        progress.add_completed("books");
        progress.add_failed("images");
        progress.flush(&success, &failed);
        progress.add_completed("songs");
        progress.flush(&success, &failed);

        assert_eq!(fs::read_to_string(&success).unwrap(), "books\nsongs\n");
        assert_eq!(fs::read_to_string(&failed).unwrap(), "images\n");
        assert_eq!(progress.pending(), 0);
    }

    #[test]
    fn test_write_failure_requeues() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent").join("success.txt");
        let progress = VectorProgress::new();

        progress.add_completed("books");
        progress.flush(&missing, &dir.path().join("failed.txt"));

        assert_eq!(progress.pending(), 1);
    }
}

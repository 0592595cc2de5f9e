use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Liveness marker of the controller, rewritten on every interval while a
/// task runs and removed when it stops.
#[derive(Debug)]
pub struct Heartbeat {
    path: PathBuf,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn(path: PathBuf, interval: Duration) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = fs::write(&task_path, Utc::now().to_rfc3339()) {
                    warn!(path = %task_path.display(), error = %e, "Failed to write heartbeat");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = signal.changed() => break,
                }
            }
        });

        debug!(path = %path.display(), "💓 Heartbeat started");
        Self {
            path,
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove heartbeat");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_written_and_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat");
        let heartbeat = Heartbeat::spawn(path.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!fs::read_to_string(&path).unwrap().is_empty());

        heartbeat.stop().await;
        assert!(!path.exists());
    }
}

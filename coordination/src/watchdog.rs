//! Output Watchdog — file-size stability detector used to reap hung agents.
//!
//! Polls a target path; once its size is at least `min_file_size` and has
//! not changed across `stability_window`, the file is considered "stable"
//! and its contents are sent on `stable_rx` (spec §4.8). Used by the
//! Semantic Moderator to cancel an agent that wrote its full output then
//! hung without exiting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub stability_window: Duration,
    pub min_file_size: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stability_window: Duration::from_secs(5),
            min_file_size: 1024,
        }
    }
}

/// Handle to a running watchdog. `stable_rx` yields the stable file
/// contents exactly once, the first time stability is detected.
pub struct OutputWatchdog {
    path: PathBuf,
    config: WatchdogConfig,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl OutputWatchdog {
    pub fn new(path: impl Into<PathBuf>, config: WatchdogConfig) -> Self {
        Self {
            path: path.into(),
            config,
            stopped: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Begin polling on a background task, returning the receiver that
    /// yields the stabilized content exactly once. Idempotent with
    /// [`Self::stop`]: calling `start` twice without an intervening `stop`
    /// returns a receiver that never yields.
    pub fn start(&mut self) -> mpsc::Receiver<String> {
        let (stable_tx, rx) = mpsc::channel(1);
        if self.task.is_some() {
            return rx;
        }
        let path = self.path.clone();
        let config = self.config;
        let stopped = self.stopped.clone();

        let handle = tokio::spawn(async move {
            let mut last_size: Option<u64> = None;
            let mut stable_since: Option<tokio::time::Instant> = None;

            loop {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(config.poll_interval).await;
                if stopped.load(Ordering::SeqCst) {
                    return;
                }

                let size = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(_) => {
                        last_size = None;
                        stable_since = None;
                        continue;
                    }
                };

                if size < config.min_file_size {
                    last_size = Some(size);
                    stable_since = None;
                    continue;
                }

                match last_size {
                    Some(prev) if prev == size => {
                        let since = stable_since.get_or_insert_with(tokio::time::Instant::now);
                        if since.elapsed() >= config.stability_window {
                            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                                debug!(path = %path.display(), size, "watchdog: output stabilized");
                                let _ = stable_tx.try_send(content);
                            }
                            return;
                        }
                    }
                    _ => {
                        stable_since = None;
                    }
                }
                last_size = Some(size);
            }
        });
        self.task = Some(handle);
        rx
    }

    /// Stop the watchdog. Idempotent — safe to call multiple times or after
    /// the watchdog has already fired.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

impl Drop for OutputWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn fires_once_size_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.md");
        tokio::fs::write(&path, "x".repeat(2048)).await.unwrap();

        let config = WatchdogConfig {
            poll_interval: StdDuration::from_millis(10),
            stability_window: StdDuration::from_millis(50),
            min_file_size: 1024,
        };
        let mut watchdog = OutputWatchdog::new(&path, config);
        let mut rx = watchdog.start();

        let content = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("watchdog should fire")
            .expect("channel should yield content");
        assert_eq!(content.len(), 2048);
        watchdog.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.md");
        let mut watchdog = OutputWatchdog::new(&path, WatchdogConfig::default());
        let _rx = watchdog.start();
        watchdog.stop();
        watchdog.stop();
    }
}

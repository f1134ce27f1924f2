//! Out-of-band pause/cancel control plane (spec §5 "Cancellation").
//!
//! `Control` never throws away work: pausing blocks the caller until
//! resumed, and cancellation is cooperative — callers check
//! `check_cancelled` at safe points rather than being killed outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("workflow cancelled")]
    Cancelled,
}

/// Shared pause/cancel flag plus a `Notify` used to wake waiters on resume.
#[derive(Clone)]
pub struct Control {
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    resume: Arc<Notify>,
}

impl Control {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            resume: Arc::new(Notify::new()),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake any paused waiter so it can observe the cancellation.
        self.resume.notify_waiters();
    }

    pub fn check_cancelled(&self) -> Result<(), ControlError> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(ControlError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until resumed (or cancelled). Never drops queued work — the
    /// caller resumes exactly where it left off.
    pub async fn wait_if_paused(&self) -> Result<(), ControlError> {
        loop {
            self.check_cancelled()?;
            if !self.paused.load(Ordering::SeqCst) {
                return Ok(());
            }
            // Register interest before re-checking the flag, otherwise a
            // resume()/cancel() landing between the check above and
            // `.notified().await` below is missed and this waits forever.
            let notified = self.resume.notified();
            if !self.paused.load(Ordering::SeqCst) || self.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            notified.await;
        }
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pause_blocks_until_resumed() {
        let control = Control::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_if_paused().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.resume();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancel_wakes_paused_waiter_with_error() {
        let control = Control::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_if_paused().await });

        control.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ControlError::Cancelled)));
    }
}

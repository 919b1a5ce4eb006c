use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Shared operator-interrupt flag.
///
/// Nothing is ever sent on the wake channel. Cancelling drops the only
/// sender, which disconnects every cloned receiver, so a blocking
/// `select!` on [`CancelToken::receiver`] returns as soon as the run is
/// cancelled.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    wake: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(sender))),
            wake: receiver,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut trigger) = self.trigger.lock() {
            drop(trigger.take());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once cancelled.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.wake
    }

    /// Returns `Err(Interrupted)` if the run was cancelled.
    pub fn check(&self) -> Result<()> {
        match self.is_cancelled() {
            true => Err(Error::Interrupted),
            false => Ok(()),
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Error::Interrupted),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cancel_wakes_sleepers() {
        let token = CancelToken::new();
        let clone = token.clone();
        let handle = std::thread::spawn(move || clone.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        token.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)).is_ok());
        assert!(token.check().is_ok());
    }
}

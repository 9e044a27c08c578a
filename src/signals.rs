use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Why the control loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Tick,
    Triggered,
}

/// Tick/trigger gate shared between the control loop and the audio callbacks.
///
/// A trigger is a single pending slot: several triggers before the loop waits collapse
/// into one early wake-up.
#[derive(Debug, Default)]
pub struct ControlSignals {
    pending: Mutex<bool>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.wake.notify_one();
    }

    /// Blocks until triggered or `timeout` elapses, consuming the pending trigger.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .wake
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        if std::mem::take(&mut *pending) {
            Wake::Triggered
        } else {
            Wake::Tick
        }
    }

    /// Asks the loop to stop after its current iteration and wakes it.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.trigger();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// SIGINT/SIGTERM: the first one shuts down cleanly, another one while shutting down
    /// calls `force_exit`.
    pub fn on_signal(&self, force_exit: impl FnOnce()) {
        if self.shutdown_requested() {
            force_exit();
            return;
        }
        log::info!("caught signal, shutting down");
        self.request_shutdown();
    }
}

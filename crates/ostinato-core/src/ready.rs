//! Coarse "ready" announcement for startup and restart.
//!
//! A thread announces once; waiters block on the condvar until it does.
//! Never touched on the per-sample path.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ReadySignal {
    ready: Mutex<bool>,
    condvar: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.ready.lock() = false;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Block until announced or `timeout` elapses. Returns whether it was announced.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            let _ = self
                .condvar
                .wait_while_for(&mut ready, |ready| !*ready, timeout);
        }
        *ready
    }
}

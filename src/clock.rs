use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::Usec;

/// Source of simulated time for the flash model.
pub trait Clock: Send + Sync {
    fn now(&self) -> Usec;
}

/// Microseconds since the clock was created.
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock { origin: Instant::now() }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Usec {
        self.origin.elapsed().as_micros() as Usec
    }
}

/// Time only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Usec) -> Self {
        ManualClock { now: AtomicU64::new(start) }
    }

    pub fn set(&self, now: Usec) {
        self.now.fetch_max(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Usec) -> Usec {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Usec {
        self.now.load(Ordering::SeqCst)
    }
}

/// Stop flag that sleeping threads can be woken from.
#[derive(Default)]
pub struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    pub fn signal(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `timeout` or until signalled. Returns true once signalled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

//! Completion signaling between driver callbacks and waiting requesters.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A resettable completion latch.
///
/// Mirrors the foreign model's notification events: once fired it stays
/// signaled, carrying the completion outcome, until explicitly reset. The
/// requester resets the latch immediately before issuing the request that
/// may complete it, never after, so a late callback from a previous request
/// cannot satisfy a new wait.
pub(crate) struct Signal<T> {
    state: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Copy> Signal<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn reset(&self) {
        *self.state.lock() = None;
    }

    /// Stores the outcome and wakes any waiter. Non-blocking; callable from
    /// the driver's own execution context.
    pub(crate) fn fire(&self, value: T) {
        let mut state = self.state.lock();
        *state = Some(value);
        self.ready.notify_all();
    }

    /// Waits until the latch fires or `timeout` elapses. Returns `None` on
    /// timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.is_none() {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return *state;
            }
        }
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fire_before_wait_returns_immediately() {
        let sig = Signal::new();
        sig.fire(7u32);
        assert_eq!(sig.wait(Duration::from_millis(10)), Some(7));
        // Stays signaled until reset.
        assert_eq!(sig.wait(Duration::from_millis(10)), Some(7));
        sig.reset();
        assert_eq!(sig.wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn wait_sees_fire_from_another_thread() {
        let sig = std::sync::Arc::new(Signal::new());
        let firer = {
            let sig = sig.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sig.fire(1u32);
            })
        };
        assert_eq!(sig.wait(Duration::from_secs(2)), Some(1));
        firer.join().unwrap();
    }

    #[test]
    fn wait_times_out_when_never_fired() {
        let sig: Signal<u32> = Signal::new();
        let start = Instant::now();
        assert_eq!(sig.wait(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}

//! Wake-up primitive between a writer thread and a blocked reader.
//!
//! Stands in for the OS socket-pair signaler: every `send` deposits one
//! signal, `wait` blocks until at least one signal is pending, `recv`
//! consumes exactly one. Closing the signaler releases every waiter with
//! [`SignalError::Closed`].

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a wait ended without a signal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// No signal arrived before the timeout.
    #[error("signaler wait timed out")]
    Timeout,
    /// The signaler was closed.
    #[error("signaler closed")]
    Closed,
}

#[derive(Debug, Default)]
struct State {
    pending: usize,
    closed: bool,
}

/// Counting wake-up signal.
#[derive(Debug, Default)]
pub struct Signaler {
    state: Mutex<State>,
    ready: Condvar,
}

impl Signaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit one signal and wake a waiter.
    pub fn send(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.pending += 1;
        drop(state);
        self.ready.notify_one();
    }

    /// Wait until a signal is pending.
    ///
    /// - `None`: wait forever
    /// - `Some(Duration::ZERO)`: poll
    /// - `Some(d)`: wait at most `d`; a deadline past the clock's range
    ///   waits forever
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), SignalError> {
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(SignalError::Closed);
            }
            if state.pending > 0 {
                return Ok(());
            }
            match deadline {
                None => self.ready.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(SignalError::Timeout);
                    }
                    // Spurious wake-ups and timeouts both re-check the state.
                    let _ = self.ready.wait_until(&mut state, deadline);
                }
            }
        }
    }

    /// Consume one pending signal.
    ///
    /// # Panics
    ///
    /// Panics if no signal is pending: callers only `recv` after a
    /// successful `wait`.
    pub fn recv(&self) {
        let mut state = self.state.lock();
        assert!(state.pending > 0, "signaler recv without a pending signal");
        state.pending -= 1;
    }

    /// Close the signaler, releasing every blocked waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending = 0;
        drop(state);
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_poll_without_signal_times_out() {
        let signaler = Signaler::new();
        assert_eq!(signaler.wait(Some(Duration::ZERO)), Err(SignalError::Timeout));
        assert_eq!(
            signaler.wait(Some(Duration::from_millis(5))),
            Err(SignalError::Timeout)
        );
    }

    #[test]
    fn test_signals_are_counted() {
        let signaler = Signaler::new();
        signaler.send();
        signaler.send();
        assert!(signaler.wait(Some(Duration::ZERO)).is_ok());
        signaler.recv();
        assert!(signaler.wait(Some(Duration::ZERO)).is_ok());
        signaler.recv();
        assert!(signaler.wait(Some(Duration::ZERO)).is_err());
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let signaler = Arc::new(Signaler::new());
        let remote = Arc::clone(&signaler);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.send();
        });
        assert!(signaler.wait(None).is_ok());
        signaler.recv();
        handle.join().unwrap();
    }

    #[test]
    fn test_unbounded_timeout_waits_for_signal() {
        let signaler = Arc::new(Signaler::new());
        let remote = Arc::clone(&signaler);
        let handle = std::thread::spawn(move || remote.wait(Some(Duration::MAX)));
        std::thread::sleep(Duration::from_millis(10));
        signaler.send();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_close_releases_waiter() {
        let signaler = Arc::new(Signaler::new());
        let remote = Arc::clone(&signaler);
        let handle = std::thread::spawn(move || remote.wait(None));
        std::thread::sleep(Duration::from_millis(10));
        signaler.close();
        assert_eq!(handle.join().unwrap(), Err(SignalError::Closed));
        assert!(signaler.is_closed());
    }
}

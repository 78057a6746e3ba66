//! Connect-completion signal.
//!
//! A manual-reset signal built on a watch channel. [`ConnectSignal::set`]
//! latches the signaled state until an explicit [`ConnectSignal::reset`], and
//! an observer that subscribes after the state was latched still sees it.
//! The accept loop sets the signal when a client connect completes and
//! re-arms it before waiting for the next one.

use tokio::sync::watch;

/// Owner side of the connect-completion signal.
///
/// Held by the proxy instance; dropped together with it.
#[derive(Debug)]
pub struct ConnectSignal {
    state: watch::Sender<bool>,
}

/// Observer side of a [`ConnectSignal`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectWatch {
    state: watch::Receiver<bool>,
}

impl ConnectSignal {
    /// Creates a signal in the unsignaled state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    /// Latches the signaled state.
    pub fn set(&self) {
        self.state.send_replace(true);
    }

    /// Returns the signal to the unsignaled state.
    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    /// Returns true while the signaled state is latched.
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Creates an observer for this signal.
    pub fn watch(&self) -> ConnectWatch {
        ConnectWatch {
            state: self.state.subscribe(),
        }
    }
}

impl Default for ConnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectWatch {
    /// Resolves with `true` once the signal is in the signaled state.
    ///
    /// Resolves immediately when the state is already latched. Resolves with
    /// `false` if the owner dropped the signal while it was unsignaled.
    pub async fn signaled(&mut self) -> bool {
        self.state.wait_for(|set| *set).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn starts_unsignaled() {
        let signal = ConnectSignal::new();
        assert!(!signal.is_set());
    }

    #[test]
    fn set_latches_until_reset() {
        let signal = ConnectSignal::new();
        signal.set();
        assert!(signal.is_set());
        signal.set();
        assert!(signal.is_set());
        signal.reset();
        assert!(!signal.is_set());
    }

    #[test]
    fn waiter_pends_until_set() {
        let signal = ConnectSignal::new();
        let mut watch = signal.watch();

        let mut waiting = task::spawn(watch.signaled());
        assert_pending!(waiting.poll());

        signal.set();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), true);
    }

    #[test]
    fn late_subscriber_sees_latched_state() {
        let signal = ConnectSignal::new();
        signal.set();

        let mut watch = signal.watch();
        let mut waiting = task::spawn(watch.signaled());
        assert_ready_eq!(waiting.poll(), true);
    }

    #[test]
    fn reset_rearms_the_wait() {
        let signal = ConnectSignal::new();
        signal.set();
        signal.reset();

        let mut watch = signal.watch();
        let mut waiting = task::spawn(watch.signaled());
        assert_pending!(waiting.poll());

        signal.set();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), true);
    }

    #[test]
    fn dropped_owner_releases_waiters() {
        let signal = ConnectSignal::new();
        let mut watch = signal.watch();

        let mut waiting = task::spawn(watch.signaled());
        assert_pending!(waiting.poll());

        drop(signal);
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), false);
    }
}

//! 100-Continue gate.
//!
//! Guards the single transition from "headers sent, body held back" to
//! "send the body now". The continue timer, an interim `100 Continue` and
//! a final response all race to signal it; only the first one wins.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Default time to wait for `100 Continue` before sending the body anyway.
pub const DEFAULT_CONTINUE_TIMEOUT: Duration = Duration::from_millis(350);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GateState {
    Idle = 0,
    Waiting = 1,
    Signaled = 2,
}

#[derive(Debug)]
pub struct ContinueGate {
    state: AtomicU8,
    notify: Notify,
}

impl Default for ContinueGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinueGate {
    pub fn new() -> Self {
        Self { state: AtomicU8::new(GateState::Idle as u8), notify: Notify::new() }
    }

    pub fn state(&self) -> GateState {
        match self.state.load(Ordering::Acquire) {
            1 => GateState::Waiting,
            2 => GateState::Signaled,
            _ => GateState::Idle,
        }
    }

    /// Headers are out and the body is being held. No-op unless idle.
    pub fn trigger(&self) -> bool {
        self.state
            .compare_exchange(
                GateState::Idle as u8,
                GateState::Waiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Release the body. Returns true for the one caller that performed
    /// the transition; later callers get false.
    pub fn signal(&self) -> bool {
        let prev = self.state.swap(GateState::Signaled as u8, Ordering::AcqRel);
        if prev == GateState::Signaled as u8 {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_signaled(&self) -> bool {
        self.state() == GateState::Signaled
    }

    /// Wait until the gate is signaled.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_signaled() {
                return;
            }
            notified.await;
        }
    }

    /// Wait at most `timeout`, then signal the gate ourselves.
    /// Returns true when the timer performed the transition.
    pub async fn wait_or_expire(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.wait()).await.is_ok() {
            return false;
        }
        let fired = self.signal();
        if fired {
            tracing::debug!(timeout_ms = timeout.as_millis() as u64, "continue timer expired");
        }
        fired
    }

    /// Back to idle for the next leg of the same request.
    pub fn reset(&self) {
        self.state.store(GateState::Idle as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_signal_is_idempotent() {
        let gate = ContinueGate::new();
        assert!(gate.trigger());
        assert!(!gate.trigger());
        assert!(gate.signal());
        assert!(!gate.signal());
        assert_eq!(gate.state(), GateState::Signaled);
    }

    #[test]
    fn test_reset() {
        let gate = ContinueGate::new();
        gate.signal();
        gate.reset();
        assert_eq!(gate.state(), GateState::Idle);
        assert!(gate.signal());
    }

    #[tokio::test]
    async fn test_concurrent_signal_has_one_winner() {
        let gate = Arc::new(ContinueGate::new());
        gate.trigger();
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            let winners = Arc::clone(&winners);
            handles.push(tokio::spawn(async move {
                if gate.signal() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_when_nothing_arrives() {
        let gate = ContinueGate::new();
        gate.trigger();
        assert!(gate.wait_or_expire(DEFAULT_CONTINUE_TIMEOUT).await);
        assert!(gate.is_signaled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interim_response_beats_timer() {
        let gate = Arc::new(ContinueGate::new());
        gate.trigger();
        let remote = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(remote.signal());
        });
        assert!(!gate.wait_or_expire(DEFAULT_CONTINUE_TIMEOUT).await);
        assert!(gate.is_signaled());
    }
}

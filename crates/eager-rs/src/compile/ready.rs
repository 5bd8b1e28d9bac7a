//! One-shot readiness signal shared between the builder thread and waiting callers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

const PENDING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// Settles exactly once, from pending to ready or failed. Once observed settled, the state never
/// changes again.
#[derive(Debug, Default)]
pub struct ReadySignal {
    state: AtomicU8,
    failure: OnceLock<String>,
    lock: Mutex<()>,
    settled: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Readiness {
        match self.state.load(Ordering::Acquire) {
            PENDING => Readiness::Pending,
            READY => Readiness::Ready,
            _ => Readiness::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == Readiness::Ready
    }

    /// Returns `false` when the signal had already settled.
    pub fn set_ready(&self) -> bool {
        self.settle(READY)
    }

    pub fn set_failed(&self, message: impl Into<String>) -> bool {
        // Publish the message before the state so waiters that see FAILED can read it.
        let _ = self.failure.set(message.into());
        self.settle(FAILED)
    }

    fn settle(&self, state: u8) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            let _guard = self.lock.lock().expect("ready signal poisoned");
            self.settled.notify_all();
        }
        won
    }

    /// Waits until the signal settles: yields up to `spin_limit` times, then blocks.
    pub fn wait(&self, spin_limit: usize) -> Result<(), String> {
        for _ in 0..spin_limit {
            if self.state() != Readiness::Pending {
                return self.outcome();
            }
            std::thread::yield_now();
        }
        let mut guard = self.lock.lock().expect("ready signal poisoned");
        while self.state() == Readiness::Pending {
            guard = self.settled.wait(guard).expect("ready signal poisoned");
        }
        drop(guard);
        self.outcome()
    }

    fn outcome(&self) -> Result<(), String> {
        match self.state() {
            Readiness::Ready => Ok(()),
            Readiness::Failed => Err(self
                .failure
                .get()
                .cloned()
                .unwrap_or_else(|| "kernel build failed".to_string())),
            Readiness::Pending => Err("kernel build still pending".to_string()),
        }
    }
}

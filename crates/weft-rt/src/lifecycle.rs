// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Termination state machine of a scheduler thread.
//!
//! `Running` → `ShutdownRequested` → `Terminated`. `Kill` jumps straight to
//! `Terminated` from either earlier state. `Terminated` is final.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Running,
    ShutdownRequested,
    Terminated,
}

impl Lifecycle {
    pub fn is_terminated(self) -> bool {
        self == Lifecycle::Terminated
    }

    fn request_shutdown(self) -> Self {
        match self {
            Lifecycle::Running => Lifecycle::ShutdownRequested,
            other => other,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::ShutdownRequested => write!(f, "shutdown-requested"),
            Lifecycle::Terminated => write!(f, "terminated"),
        }
    }
}

/// Shared lifecycle slot. Written by the scheduler's own strands, read by
/// anyone holding a handle.
pub(crate) struct LifecycleCell {
    state: Mutex<Lifecycle>,
    changed: Condvar,
}

impl LifecycleCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Lifecycle::Running),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> Lifecycle {
        *self.state.lock()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.get() == Lifecycle::ShutdownRequested
    }

    /// Returns true if this call moved the state.
    pub fn request_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        let next = state.request_shutdown();
        let moved = next != *state;
        *state = next;
        moved
    }

    pub fn terminate(&self) {
        let mut state = self.state.lock();
        *state = Lifecycle::Terminated;
        self.changed.notify_all();
    }

    /// Block until `Terminated` or until `timeout` elapses.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_terminated() {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.is_terminated();
            }
        }
        true
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber: handle to pending work with a single outcome.
//!
//! A fiber is created on a scheduler thread and owned by it. The outcome is
//! written once, from any OS thread, through the matching `Completer`. The
//! same write takes the fiber out of the owner's active set and collects the
//! strands parked on it; a `ResultReady` command then resumes them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::{Command, CommandSender};
use crate::context::{self, FiberContext};
use crate::error::{BridgeError, UsageError};
use crate::scheduler::{LocalState, SchedulerId};

static NEXT_FIBER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn next() -> Self {
        FiberId(NEXT_FIBER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct FiberCell<T> {
    finished: AtomicBool,
    outcome: Mutex<Option<Result<T, BridgeError>>>,
}

/// Handle to pending work. Consumed by `join()`.
pub struct Fiber<T> {
    id: FiberId,
    owner: SchedulerId,
    cell: Arc<FiberCell<T>>,
}

/// Write side of a fiber. Single use: `set_result` consumes it, and dropping
/// it unused completes the fiber with `BridgeError::Abandoned`.
pub struct Completer<T> {
    id: FiberId,
    cell: Option<Arc<FiberCell<T>>>,
    local: Arc<Mutex<LocalState>>,
    commands: CommandSender,
}

impl<T> Fiber<T> {
    /// Allocate a fiber owned by the caller's scheduler thread and add it to
    /// that thread's active set.
    pub(crate) fn register(cx: &FiberContext) -> (Fiber<T>, Completer<T>) {
        let id = FiberId::next();
        let cell = Arc::new(FiberCell {
            finished: AtomicBool::new(false),
            outcome: Mutex::new(None),
        });
        cx.local.lock().add_fiber(id);
        let fiber = Fiber {
            id,
            owner: cx.thread.id(),
            cell: cell.clone(),
        };
        let completer = Completer {
            id,
            cell: Some(cell),
            local: cx.local.clone(),
            commands: cx.thread.commands().clone(),
        };
        (fiber, completer)
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Scheduler thread that owns this fiber.
    pub fn owner(&self) -> SchedulerId {
        self.owner
    }

    pub fn is_finished(&self) -> bool {
        self.cell.finished.load(Ordering::Acquire)
    }

    /// Wait for the outcome.
    ///
    /// Returns at once if the fiber already finished. Otherwise the calling
    /// fiber parks until the owner processes the matching `ResultReady`.
    /// Either way the fiber has left the owner's active set by then.
    pub fn join(self) -> Result<T, BridgeError> {
        if !self.is_finished() {
            let cx = joining_context()?;
            self.check_owner(&cx)?;
            park_until(&cx, &[self.id], || self.is_finished())?;
        }
        self.take()
    }

    fn check_owner(&self, cx: &FiberContext) -> Result<(), UsageError> {
        let current = cx.thread.id();
        if self.owner != current {
            return Err(UsageError::ForeignFiber {
                fiber: self.id,
                owner: self.owner,
                current,
            });
        }
        Ok(())
    }

    fn take(self) -> Result<T, BridgeError> {
        self.cell
            .outcome
            .lock()
            .take()
            .unwrap_or(Err(BridgeError::Abandoned))
    }
}

impl<T> fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> Completer<T> {
    pub fn fiber_id(&self) -> FiberId {
        self.id
    }

    /// Record the outcome, leave the owner's active set and notify the
    /// owning scheduler thread.
    pub fn set_result(mut self, outcome: Result<T, BridgeError>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<T, BridgeError>) {
        let Some(cell) = self.cell.take() else {
            return;
        };
        // Joiners check `finished` under the same lock before parking.
        let waiters = {
            let mut local = self.local.lock();
            *cell.outcome.lock() = Some(outcome);
            cell.finished.store(true, Ordering::Release);
            local.complete(self.id).unwrap_or_default()
        };
        let cmd = Command::ResultReady {
            fiber: self.id,
            waiters,
        };
        if let Err(err) = self.commands.send(cmd) {
            tracing::warn!(
                fiber = %self.id,
                thread = %self.commands.thread(),
                command = err.0.name(),
                "scheduler thread terminated, dropping command"
            );
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.cell.is_some() {
            tracing::warn!(fiber = %self.id, "completer dropped without an outcome");
            self.finish(Err(BridgeError::Abandoned));
        }
    }
}

/// Fiber context for a join, reported as `NotInFiber` when absent.
fn joining_context() -> Result<std::rc::Rc<FiberContext>, UsageError> {
    context::fiber().map_err(|e| match e {
        UsageError::NoBackend => UsageError::NotInFiber,
        other => other,
    })
}

/// Park the calling fiber until `done` holds.
///
/// Registers the caller as a waiter on every fiber in `ids` before each
/// suspension. Wakes for other reasons are harmless: the loop re-checks.
/// `done` must only read completion flags; it runs under the local lock.
fn park_until(
    cx: &FiberContext,
    ids: &[FiberId],
    done: impl Fn() -> bool,
) -> Result<(), BridgeError> {
    loop {
        {
            let mut local = cx.local.lock();
            if done() {
                return Ok(());
            }
            for id in ids {
                local.add_waiter(*id, cx.strand);
            }
        }
        cx.suspend()?;
    }
}

/// Join every fiber. Results are index-aligned with `fibers`; the first
/// error in index order is returned after all of them finished.
pub fn join_all<T>(fibers: Vec<Fiber<T>>) -> Result<Vec<T>, BridgeError> {
    let pending: Vec<FiberId> = fibers
        .iter()
        .filter(|f| !f.is_finished())
        .map(|f| f.id)
        .collect();
    if !pending.is_empty() {
        let cx = joining_context()?;
        for fiber in &fibers {
            fiber.check_owner(&cx)?;
        }
        park_until(&cx, &pending, || fibers.iter().all(Fiber::is_finished))?;
    }
    fibers.into_iter().map(Fiber::take).collect()
}

/// Yield `(index, outcome)` pairs in completion order.
pub fn join_iter<T>(fibers: Vec<Fiber<T>>) -> JoinIter<T> {
    JoinIter {
        pending: fibers.into_iter().enumerate().collect(),
    }
}

pub struct JoinIter<T> {
    pending: Vec<(usize, Fiber<T>)>,
}

impl<T> JoinIter<T> {
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    fn finished_position(&self) -> Option<usize> {
        self.pending.iter().position(|(_, f)| f.is_finished())
    }

    fn wait_any(&self) -> Result<(), BridgeError> {
        let cx = joining_context()?;
        for (_, fiber) in &self.pending {
            fiber.check_owner(&cx)?;
        }
        let ids: Vec<FiberId> = self.pending.iter().map(|(_, f)| f.id).collect();
        park_until(&cx, &ids, || self.finished_position().is_some())
    }
}

impl<T> Iterator for JoinIter<T> {
    type Item = (usize, Result<T, BridgeError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() {
            return None;
        }
        let pos = match self.finished_position() {
            Some(pos) => pos,
            None => {
                if let Err(e) = self.wait_any() {
                    // Nothing left can be joined from here.
                    let (index, _) = self.pending.swap_remove(0);
                    self.pending.clear();
                    return Some((index, Err(e)));
                }
                self.finished_position()?
            }
        };
        let (index, fiber) = self.pending.remove(pos);
        Some((index, fiber.take()))
    }
}

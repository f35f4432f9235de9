// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawning sibling fibers and blocking work.
//!
//! `spawn` queues a fiber on the caller's own scheduler thread. It does not
//! run until the caller suspends. `spawn_blocking` starts a whole child
//! scheduler thread for the work and shuts it down once the outcome has
//! been handed back.

use crate::context::{self, BackendMode};
use crate::error::{BoxError, BridgeError, UsageError};
use crate::fiber::Fiber;
use crate::runtime::Runtime;
use crate::scheduler::{SchedulerThread, ThreadHandle};
use crate::task::capture;

/// Queue `f` as a new fiber on the calling fiber's scheduler thread.
pub fn spawn<T, F>(f: F) -> Result<Fiber<T>, BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    let cx = context::fiber()?;
    let (fiber, completer) = Fiber::register(&cx);
    cx.thread
        .submit_fiber(fiber.id(), f, move |outcome| completer.set_result(outcome))?;
    Ok(fiber)
}

/// Run `f` on a fresh child scheduler thread.
///
/// The returned fiber belongs to the caller's thread. The child inherits
/// the caller's thread-start hook and starts shutting down right after the
/// outcome was handed back.
pub fn spawn_blocking<T, F>(f: F) -> Result<Fiber<T>, BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    let cx = context::fiber()?;
    let child = SchedulerThread::start(
        cx.thread.runtime().clone(),
        cx.thread.on_thread_start().cloned(),
    )?
    .detach();
    tracing::debug!(parent = %cx.thread.id(), child = %child.id(), "spawned blocking thread");

    let (fiber, completer) = Fiber::register(&cx);
    submit_then_shutdown(&child, f, move |outcome| completer.set_result(outcome))?;
    Ok(fiber)
}

/// Blocking spawn from outside any fiber. `completion` receives the
/// outcome on the child thread; the child then shuts down.
pub fn spawn_blocking_detached<T, F, C>(
    runtime: &Runtime,
    f: F,
    completion: C,
) -> Result<ThreadHandle, BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    C: FnOnce(Result<T, BridgeError>) + Send + 'static,
{
    let child = runtime.start_scheduler()?.detach();
    submit_then_shutdown(&child, f, completion)?;
    Ok(child)
}

fn submit_then_shutdown<T, F, C>(child: &ThreadHandle, f: F, completion: C) -> Result<(), BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    C: FnOnce(Result<T, BridgeError>) + Send + 'static,
{
    let this = child.clone();
    let queued = child.submit(f, move |outcome| {
        completion(outcome);
        if this.start_shutdown().is_err() {
            tracing::warn!(thread = %this.id(), "blocking thread gone before shutdown");
        }
    });
    if queued.is_err() {
        let _ = child.kill();
    }
    queued
}

/// Run blocking work without stalling the current scheduler thread.
///
/// On a fiber this is `spawn_blocking(f)?.join()`. With no backend on the
/// thread, `f` runs inline.
pub fn run_blocking<T, F>(f: F) -> Result<T, BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    match context::try_current_mode() {
        None => capture(f),
        Some(BackendMode::Cooperative) => spawn_blocking(f)?.join(),
        Some(found) => Err(UsageError::WrongBackend {
            expected: BackendMode::Cooperative,
            found,
        }
        .into()),
    }
}

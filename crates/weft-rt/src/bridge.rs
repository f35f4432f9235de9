// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuation bridge: turn a callback-style native operation into a
//! suspension point.
//!
//! A native operation has the shape `op(delivery)`. It returns at once and
//! invokes the delivery exactly once, later, possibly from another thread.
//! The calling thread's backend decides what the caller gets back:
//!
//! - cooperative: a `Fiber` completed by the delivery through the owner's
//!   command queue. `call` joins it right away.
//! - event loop: a `LoopFuture` resolved on the loop thread through
//!   `call_soon_threadsafe`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::{self, BackendMode};
use crate::delivery::Delivery;
use crate::engine::NativeEngine;
use crate::error::{BoxError, BridgeError, UsageError};
use crate::event_loop::{self, LoopFuture};
use crate::fiber::Fiber;
use crate::scheduler::ThreadHandle;
use crate::task::native_error;

/// Outcome of a bridge call, shaped by the backend of the calling thread.
#[derive(Debug)]
pub enum Continuation<T> {
    Fiber(Fiber<T>),
    Future(LoopFuture<T>),
}

impl<T> Continuation<T> {
    pub fn into_fiber(self) -> Option<Fiber<T>> {
        match self {
            Continuation::Fiber(f) => Some(f),
            Continuation::Future(_) => None,
        }
    }

    pub fn into_future(self) -> Option<LoopFuture<T>> {
        match self {
            Continuation::Future(f) => Some(f),
            Continuation::Fiber(_) => None,
        }
    }
}

/// Synchronous-style call: suspend the calling fiber until `op` delivers.
pub fn call<T, Op>(op: Op) -> Result<T, BridgeError>
where
    T: Send + 'static,
    Op: FnOnce(Delivery<T>),
{
    call_deferred(op)?.join()
}

/// Start `op` and return its fiber without waiting.
pub fn call_deferred<T, Op>(op: Op) -> Result<Fiber<T>, BridgeError>
where
    T: Send + 'static,
    Op: FnOnce(Delivery<T>),
{
    let cx = context::fiber()?;
    let (fiber, completer) = Fiber::register(&cx);
    drop(cx);
    op(Delivery::new(move |outcome: Result<T, BoxError>| {
        completer.set_result(outcome.map_err(native_error));
    }));
    Ok(fiber)
}

/// Start `op` from the event loop and return an awaitable for its outcome.
pub fn call_async<T, Op>(op: Op) -> Result<LoopFuture<T>, BridgeError>
where
    T: Send + 'static,
    Op: FnOnce(Delivery<T>),
{
    let handle = context::current_loop()?;
    let (tx, fut) = event_loop::channel();
    op(Delivery::new(move |outcome: Result<T, BoxError>| {
        handle.call_soon_threadsafe(move || {
            let _ = tx.send(outcome.map_err(native_error));
        });
    }));
    Ok(fut)
}

/// Start `op` under whichever backend the calling thread runs.
pub fn wrap<T, Op>(op: Op) -> Result<Continuation<T>, BridgeError>
where
    T: Send + 'static,
    Op: FnOnce(Delivery<T>),
{
    match context::current_mode()? {
        BackendMode::Cooperative => call_deferred(op).map(Continuation::Fiber),
        BackendMode::EventLoop => call_async(op).map(Continuation::Future),
    }
}

/// Like `wrap`, reshaping the raw value before it reaches the caller.
pub fn wrap_with<R, T, Op, Sh>(op: Op, reshape: Sh) -> Result<Continuation<T>, BridgeError>
where
    R: Send + 'static,
    T: Send + 'static,
    Op: FnOnce(Delivery<R>),
    Sh: FnOnce(R) -> Result<T, BoxError> + Send + 'static,
{
    wrap(move |delivery: Delivery<T>| op(delivery.reshaped(reshape)))
}

fn engine() -> Result<Arc<dyn NativeEngine>, UsageError> {
    Ok(context::current_runtime()?.engine().clone())
}

/// Suspend the calling fiber for `ms` milliseconds.
pub fn sleep_ms(ms: u64) -> Result<(), BridgeError> {
    let engine = engine()?;
    call(move |d| engine.sleep_ms(d, ms))
}

pub fn sleep_ms_async(ms: u64) -> Result<LoopFuture<()>, BridgeError> {
    let engine = engine()?;
    call_async(move |d| engine.sleep_ms(d, ms))
}

/// Let other fibers of this thread run before continuing.
pub fn yield_now() -> Result<(), BridgeError> {
    sleep_ms(0)
}

pub fn read_file_bytes(path: impl Into<PathBuf>) -> Result<Vec<u8>, BridgeError> {
    let engine = engine()?;
    let path = path.into();
    call(move |d| engine.read_file_bytes(d, path))
}

pub fn read_file_bytes_async(path: impl Into<PathBuf>) -> Result<LoopFuture<Vec<u8>>, BridgeError> {
    let engine = engine()?;
    let path = path.into();
    call_async(move |d| engine.read_file_bytes(d, path))
}

/// From a fiber: run `fut` on the runtime's event loop and suspend until it
/// finishes.
pub fn dispatch_to_loop<T, F>(fut: F) -> Result<T, BridgeError>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T, BoxError>> + Send + 'static,
{
    let handle = context::current_runtime()?.event_loop()?;
    call(move |d| handle.spawn(fut, d))
}

/// From the event loop: run `f` in a fiber on `thread` and await its
/// outcome without blocking the loop.
pub fn dispatch_to_fibers<T, F>(thread: &ThreadHandle, f: F) -> Result<LoopFuture<T>, BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    let handle = context::current_loop()?;
    let (tx, fut) = event_loop::channel();
    thread.submit(f, move |outcome| {
        handle.call_soon_threadsafe(move || {
            let _ = tx.send(outcome);
        });
    })?;
    Ok(fut)
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread runtime context.
//!
//! Every OS thread that runs bridged code carries exactly one context value,
//! installed when the thread starts and never replaced. The context fixes
//! the backend mode for that thread. Code running without a context gets
//! `UsageError::NoBackend` from every bridge primitive.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{BridgeError, UsageError};
use crate::event_loop::LoopHandle;
use crate::runtime::Runtime;
use crate::scheduler::{LocalState, SchedulerId, ThreadHandle};
use crate::strand::{StrandId, ToProcessor, Wake};

/// How a thread turns native callbacks into resumption points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendMode {
    /// Fibers on a scheduler thread, resumed through its command queue.
    Cooperative,
    /// Futures on a single-threaded event loop.
    EventLoop,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Cooperative => write!(f, "cooperative"),
            BackendMode::EventLoop => write!(f, "event-loop"),
        }
    }
}

/// Context of one fiber strand on a scheduler thread.
pub(crate) struct FiberContext {
    pub thread: ThreadHandle,
    pub local: Arc<Mutex<LocalState>>,
    pub processor: Sender<ToProcessor>,
    pub strand: StrandId,
    pub wake: Receiver<Wake>,
}

impl FiberContext {
    /// Hand the baton back to the processor and park until resumed.
    pub fn suspend(&self) -> Result<(), BridgeError> {
        let terminated = || BridgeError::Terminated(self.thread.id());
        self.processor
            .send(ToProcessor::Resume)
            .map_err(|_| terminated())?;
        match self.wake.recv() {
            Ok(Wake::Resume) => Ok(()),
            Err(_) => Err(terminated()),
        }
    }
}

/// Context of the event-loop thread.
pub(crate) struct LoopContext {
    pub handle: LoopHandle,
    pub runtime: Runtime,
}

#[derive(Clone)]
pub(crate) enum ThreadContext {
    Cooperative(Rc<FiberContext>),
    EventLoop(Rc<LoopContext>),
}

impl ThreadContext {
    pub fn cooperative(cx: FiberContext) -> Self {
        ThreadContext::Cooperative(Rc::new(cx))
    }

    pub fn event_loop(handle: LoopHandle, runtime: Runtime) -> Self {
        ThreadContext::EventLoop(Rc::new(LoopContext { handle, runtime }))
    }

    pub fn mode(&self) -> BackendMode {
        match self {
            ThreadContext::Cooperative(_) => BackendMode::Cooperative,
            ThreadContext::EventLoop(_) => BackendMode::EventLoop,
        }
    }

    fn runtime(&self) -> &Runtime {
        match self {
            ThreadContext::Cooperative(cx) => cx.thread.runtime(),
            ThreadContext::EventLoop(cx) => &cx.runtime,
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

/// Clears the thread's context when dropped.
pub(crate) struct ContextGuard {
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}

/// Install the context for the calling OS thread. Fails if one is set.
pub(crate) fn install(cx: ThreadContext) -> Result<ContextGuard, UsageError> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(UsageError::BackendAlreadySet);
        }
        *slot = Some(cx);
        Ok(ContextGuard {
            _not_send: PhantomData,
        })
    })
}

pub(crate) fn current() -> Result<ThreadContext, UsageError> {
    CURRENT.with(|slot| slot.borrow().clone().ok_or(UsageError::NoBackend))
}

/// The fiber context, or a usage error naming the actual backend.
pub(crate) fn fiber() -> Result<Rc<FiberContext>, UsageError> {
    match current()? {
        ThreadContext::Cooperative(cx) => Ok(cx),
        ThreadContext::EventLoop(_) => Err(UsageError::WrongBackend {
            expected: BackendMode::Cooperative,
            found: BackendMode::EventLoop,
        }),
    }
}

/// The event-loop context, or a usage error naming the actual backend.
pub(crate) fn event_loop() -> Result<Rc<LoopContext>, UsageError> {
    match current()? {
        ThreadContext::EventLoop(cx) => Ok(cx),
        ThreadContext::Cooperative(_) => Err(UsageError::WrongBackend {
            expected: BackendMode::EventLoop,
            found: BackendMode::Cooperative,
        }),
    }
}

/// Backend mode of the calling thread.
pub fn current_mode() -> Result<BackendMode, UsageError> {
    current().map(|cx| cx.mode())
}

/// Backend mode of the calling thread, `None` outside the runtime.
pub fn try_current_mode() -> Option<BackendMode> {
    current_mode().ok()
}

/// Handle of the scheduler thread the calling fiber belongs to.
pub fn current_thread() -> Result<ThreadHandle, UsageError> {
    fiber().map(|cx| cx.thread.clone())
}

/// Handle of the event loop the calling task runs on.
pub fn current_loop() -> Result<LoopHandle, UsageError> {
    event_loop().map(|cx| cx.handle.clone())
}

/// Runtime the calling thread was started from.
pub fn current_runtime() -> Result<Runtime, UsageError> {
    current().map(|cx| cx.runtime().clone())
}

/// Scheduler id of the calling fiber, if any.
pub(crate) fn current_scheduler() -> Option<SchedulerId> {
    fiber().ok().map(|cx| cx.thread.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_context_outside_runtime() {
        assert_eq!(current_mode(), Err(UsageError::NoBackend));
        assert_eq!(try_current_mode(), None);
        assert!(matches!(current_thread(), Err(UsageError::NoBackend)));
        assert!(current_scheduler().is_none());
    }

    #[test]
    fn mode_display() {
        assert_eq!(BackendMode::Cooperative.to_string(), "cooperative");
        assert_eq!(BackendMode::EventLoop.to_string(), "event-loop");
    }
}

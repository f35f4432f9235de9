// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy for the bridge.
//!
//! `UsageError` is returned synchronously at the call site. Everything that
//! happens after work was handed off (a native delivery failure, user code
//! failing or panicking) ends up as a `BridgeError` in the Fiber's outcome.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::context::BackendMode;
use crate::fiber::FiberId;
use crate::scheduler::SchedulerId;

/// Boxed error produced by user code and native operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Misuse of a concurrency primitive, detected before any work is queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("no backend is configured on this thread; call from inside a fiber or an event loop")]
    NoBackend,

    #[error("this operation requires the {expected} backend, but the current thread runs {found}")]
    WrongBackend {
        expected: BackendMode,
        found: BackendMode,
    },

    #[error("the backend mode of this thread is already set")]
    BackendAlreadySet,

    #[error("joining a fiber requires a fiber context")]
    NotInFiber,

    #[error("fiber {fiber} belongs to scheduler {owner} and cannot be joined from scheduler {current}")]
    ForeignFiber {
        fiber: FiberId,
        owner: SchedulerId,
        current: SchedulerId,
    },

    #[error("block_on would deadlock: the caller runs on the thread it is waiting for")]
    BlockOnOwnThread,

    #[error("no event loop is configured for this runtime")]
    EventLoopNotConfigured,

    #[error("native client `{0}` is not available")]
    ClientUnavailable(String),
}

/// Outcome error of bridged or spawned work.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The native engine reported failure through its delivery callback.
    #[error("native delivery failed: {0}")]
    NativeDelivery(BoxError),

    /// User code inside spawned or bridged work returned an error.
    #[error("{0}")]
    Application(BoxError),

    /// User code inside spawned or bridged work panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("scheduler thread {0} terminated before the result was delivered")]
    Terminated(SchedulerId),

    #[error("failed to spawn an OS thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The completion handle was dropped without an outcome.
    #[error("work was abandoned before producing an outcome")]
    Abandoned,
}

impl BridgeError {
    /// The inner error of an `Application` outcome, if any.
    pub fn application(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            BridgeError::Application(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, BridgeError::Usage(_))
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

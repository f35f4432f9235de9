// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Weft runtime: a cooperative concurrency bridge over a callback-driven
//! native engine.
//!
//! Application code calls native operations as if they were blocking; the
//! bridge parks the calling fiber (or returns an awaitable on the event
//! loop) and resumes it when the engine delivers.
//!
//! Components:
//! - fiber: handle to pending work, single outcome, `join`
//! - scheduler: scheduler threads driven by a command queue
//! - bridge: native callbacks to suspension points, both backends
//! - spawn: sibling fibers and blocking child threads
//! - lifecycle: running / shutdown-requested / terminated
//! - event_loop: single-threaded loop backend
//! - runtime/engine: shared config, native engine, thread-start hook
//! - adapter: boundary for client adapters

pub mod adapter;
pub mod bridge;
mod command;
pub mod config;
pub mod context;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod lifecycle;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod spawn;
mod strand;
mod task;

pub use adapter::NativeClient;
pub use bridge::{
    call, call_async, call_deferred, dispatch_to_fibers, dispatch_to_loop, read_file_bytes,
    read_file_bytes_async, sleep_ms, sleep_ms_async, wrap, wrap_with, yield_now, Continuation,
};
pub use config::{ConfigError, RuntimeConfig};
pub use context::{current_loop, current_mode, current_runtime, current_thread, try_current_mode, BackendMode};
pub use delivery::Delivery;
pub use engine::{NativeEngine, TokioEngine};
pub use error::{BoxError, BridgeError, UsageError};
pub use event_loop::{EventLoopThread, LoopFuture, LoopHandle};
pub use fiber::{join_all, join_iter, Completer, Fiber, FiberId, JoinIter};
pub use lifecycle::Lifecycle;
pub use runtime::{InitHook, Runtime, RuntimeBuilder};
pub use scheduler::{SchedulerId, SchedulerThread, ThreadHandle};
pub use spawn::{run_blocking, spawn, spawn_blocking, spawn_blocking_detached};

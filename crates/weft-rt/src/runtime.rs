// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime handle: configuration, native engine and thread-start hook
//! shared by every thread started from it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use crate::config::RuntimeConfig;
use crate::engine::{NativeEngine, TokioEngine};
use crate::error::{panic_message, BridgeError, UsageError};
use crate::event_loop::{EventLoopThread, LoopHandle};
use crate::scheduler::SchedulerThread;

/// Runs on every OS thread the runtime starts that executes user code
/// (each fiber strand and the event-loop thread), before that code.
pub type InitHook = Arc<dyn Fn() + Send + Sync>;

/// Run `hook` on the calling thread. A panic is logged and contained.
pub(crate) fn run_init_hook(hook: &InitHook) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook())) {
        let current = std::thread::current();
        tracing::error!(
            thread = current.name().unwrap_or("<unnamed>"),
            panic = %panic_message(payload.as_ref()),
            "thread-start hook panicked"
        );
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    engine: Arc<dyn NativeEngine>,
    on_thread_start: Option<InitHook>,
    /// First event loop started from this runtime.
    event_loop: OnceLock<LoopHandle>,
}

/// Cheap, cloneable runtime handle.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn new(config: RuntimeConfig) -> Result<Self, BridgeError> {
        Self::builder().config(config).build()
    }

    /// Runtime configured from `WEFT_*` environment variables.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.inner.engine
    }

    pub fn on_thread_start(&self) -> Option<&InitHook> {
        self.inner.on_thread_start.as_ref()
    }

    /// Start a scheduler thread running the runtime's thread-start hook.
    pub fn start_scheduler(&self) -> Result<SchedulerThread, BridgeError> {
        SchedulerThread::start(self.clone(), self.inner.on_thread_start.clone())
    }

    /// Start an event-loop thread. The first one becomes the runtime's
    /// default loop, used by `dispatch_to_loop`.
    pub fn start_event_loop(&self) -> Result<EventLoopThread, BridgeError> {
        let thread = EventLoopThread::start(self)?;
        if self.inner.event_loop.set(thread.handle().clone()).is_ok() {
            tracing::debug!("default event loop registered");
        }
        Ok(thread)
    }

    pub fn event_loop(&self) -> Result<LoopHandle, UsageError> {
        self.inner
            .event_loop
            .get()
            .cloned()
            .ok_or(UsageError::EventLoopNotConfigured)
    }

    /// Stop the default event loop, if one was started.
    pub fn stop_event_loop(&self) {
        if let Some(handle) = self.inner.event_loop.get() {
            handle.stop();
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("event_loop", &self.inner.event_loop.get().is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    engine: Option<Arc<dyn NativeEngine>>,
    on_thread_start: Option<InitHook>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `engine` instead of the default tokio engine.
    pub fn engine(mut self, engine: Arc<dyn NativeEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn on_thread_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Runtime, BridgeError> {
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(
                TokioEngine::new(
                    self.config.resolved_native_workers(),
                    &self.config.thread_name_prefix,
                )
                .map_err(BridgeError::ThreadSpawn)?,
            ),
        };
        let start_loop = self.config.event_loop;
        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                engine,
                on_thread_start: self.on_thread_start,
                event_loop: OnceLock::new(),
            }),
        };
        if start_loop {
            runtime.start_event_loop()?.detach();
        }
        tracing::debug!(prefix = %runtime.config().thread_name_prefix, "runtime built");
        Ok(runtime)
    }
}

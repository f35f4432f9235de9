// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event-loop backend: a dedicated OS thread running a single-threaded
//! tokio runtime.
//!
//! Code on the loop thread uses the awaitable bridge calls. Other threads
//! reach the loop only through `LoopHandle`, whose `call_soon_threadsafe`
//! is the marshalling primitive native callbacks use.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use tokio::sync::{oneshot, Notify};

use crate::context::{self, ThreadContext};
use crate::delivery::Delivery;
use crate::error::{panic_message, BoxError, BridgeError, UsageError};
use crate::runtime::{run_init_hook, Runtime};
use crate::task::application_error;

/// Cloneable handle to an event-loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    handle: tokio::runtime::Handle,
    stop: Arc<Notify>,
    thread: ThreadId,
}

impl LoopHandle {
    /// Run `f` on the loop thread. Dropped silently once the loop stopped.
    pub fn call_soon_threadsafe<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    /// Drive `fut` on the loop and hand its outcome to `delivery`.
    ///
    /// An error from `fut` reaches the delivery as `BridgeError::Application`,
    /// a panic as `BridgeError::Panicked`.
    pub fn spawn<T, F>(&self, fut: F, delivery: Delivery<T>)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let task = self.handle.spawn(fut);
        self.handle.spawn(async move {
            let outcome = supervise(task).await.map_err(BoxError::from);
            delivery.deliver(outcome);
        });
    }

    /// Run `fut` on the loop and block the calling OS thread for its outcome.
    pub fn block_on<T, F>(&self, fut: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        if self.is_loop_thread() {
            return Err(UsageError::BlockOnOwnThread.into());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task = self.handle.spawn(fut);
        self.handle.spawn(async move {
            let _ = tx.send(supervise(task).await);
        });
        rx.recv().unwrap_or(Err(BridgeError::Abandoned))
    }

    /// Ask the loop to stop. Pending tasks are dropped.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        self.thread == other.thread
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.thread)
            .finish()
    }
}

async fn supervise<T>(task: tokio::task::JoinHandle<Result<T, BoxError>>) -> Result<T, BridgeError> {
    match task.await {
        Ok(outcome) => outcome.map_err(application_error),
        Err(e) if e.is_panic() => {
            let msg = panic_message(e.into_panic().as_ref());
            tracing::error!(panic = %msg, "event loop task panicked");
            Err(BridgeError::Panicked(msg))
        }
        Err(_) => Err(BridgeError::Abandoned),
    }
}

/// Awaitable outcome of work resolved on the loop thread.
pub struct LoopFuture<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

pub(crate) fn channel<T>() -> (oneshot::Sender<Result<T, BridgeError>>, LoopFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, LoopFuture { rx })
}

impl<T> Future for LoopFuture<T> {
    type Output = Result<T, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Abandoned),
        })
    }
}

impl<T> fmt::Debug for LoopFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoopFuture")
    }
}

/// Owner of an event-loop thread. Dropping it stops the loop and waits.
pub struct EventLoopThread {
    handle: LoopHandle,
    os_thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub(crate) fn start(runtime: &Runtime) -> Result<Self, BridgeError> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let name = format!("{}-loop", runtime.config().thread_name_prefix);
        let rt = runtime.clone();
        let os_thread = thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(rt, ready_tx))
            .map_err(BridgeError::ThreadSpawn)?;
        match ready_rx.recv() {
            Ok(Ok(handle)) => Ok(Self {
                handle,
                os_thread: Some(os_thread),
            }),
            Ok(Err(e)) => Err(BridgeError::ThreadSpawn(e)),
            Err(_) => Err(BridgeError::ThreadSpawn(io::Error::new(
                io::ErrorKind::Other,
                "event loop thread exited during startup",
            ))),
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn block_on<T, F>(&self, fut: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.handle.block_on(fut)
    }

    /// Stop the loop and wait for its thread.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    pub fn detach(mut self) -> LoopHandle {
        self.os_thread.take();
        self.handle.clone()
    }

    fn stop_and_join(&mut self) {
        let Some(t) = self.os_thread.take() else {
            return;
        };
        self.handle.stop();
        if self.handle.is_loop_thread() {
            return;
        }
        if t.join().is_err() {
            tracing::error!("event loop thread panicked");
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run_loop(runtime: Runtime, ready: crossbeam_channel::Sender<io::Result<LoopHandle>>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let stop = Arc::new(Notify::new());
    let handle = LoopHandle {
        handle: rt.handle().clone(),
        stop: stop.clone(),
        thread: thread::current().id(),
    };
    if let Some(hook) = runtime.on_thread_start() {
        run_init_hook(hook);
    }
    let guard = match context::install(ThreadContext::event_loop(handle.clone(), runtime)) {
        Ok(guard) => guard,
        Err(e) => {
            let _ = ready.send(Err(io::Error::new(io::ErrorKind::Other, e)));
            return;
        }
    };
    if ready.send(Ok(handle)).is_err() {
        return;
    }
    tracing::debug!("event loop started");
    rt.block_on(stop.notified());
    drop(guard);
    tracing::debug!("event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::BackendMode;

    fn event_loop() -> EventLoopThread {
        let rt = Runtime::new(RuntimeConfig::default().set_native_workers(1)).unwrap();
        rt.start_event_loop().unwrap()
    }

    #[test]
    fn block_on_returns_value() {
        let lp = event_loop();
        assert_eq!(lp.block_on(async { Ok(5) }).unwrap(), 5);
    }

    #[test]
    fn futures_see_event_loop_mode() {
        let lp = event_loop();
        let mode = lp
            .block_on(async { Ok(context::current_mode()?) })
            .unwrap();
        assert_eq!(mode, BackendMode::EventLoop);
    }

    #[test]
    fn block_on_surfaces_errors_and_panics() {
        let lp = event_loop();
        let err = lp
            .block_on(async { Err::<(), BoxError>("boom".into()) })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        let err = lp
            .block_on(async {
                if true {
                    panic!("kaput");
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Panicked(msg) if msg.contains("kaput")));
    }

    #[test]
    fn call_soon_runs_on_loop_thread() {
        let lp = event_loop();
        let handle = lp.handle().clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = handle.clone();
        handle.call_soon_threadsafe(move || tx.send(probe.is_loop_thread()).unwrap());
        assert!(rx.recv().unwrap());
        assert!(!handle.is_loop_thread());
    }

    #[test]
    fn block_on_after_stop_is_abandoned() {
        let lp = event_loop();
        let handle = lp.handle().clone();
        lp.stop();
        assert!(matches!(handle.block_on(async { Ok(1) }), Err(BridgeError::Abandoned)));
    }

    #[test]
    fn loop_future_resolves() {
        let lp = event_loop();
        let (tx, fut) = channel::<u8>();
        lp.handle().call_soon_threadsafe(move || {
            let _ = tx.send(Ok(7));
        });
        assert_eq!(lp.block_on(async move { Ok(fut.await?) }).unwrap(), 7);
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Type-erased work carried by `SpawnTask` commands.
//!
//! A task pairs the user's function with its completion callback. Running
//! it catches every failure of the function at this boundary, logs it, and
//! hands the outcome to the completion. Dropping a task without running it
//! drops the completion, which is how abandoned work is reported.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{panic_message, BoxError, BridgeError};
use crate::fiber::FiberId;

trait Runnable: Send {
    fn run(self: Box<Self>);
}

struct Job<T, F, C> {
    body: F,
    completion: C,
    _output: PhantomData<fn() -> T>,
}

impl<T, F, C> Runnable for Job<T, F, C>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send,
    C: FnOnce(Result<T, BridgeError>) + Send,
{
    fn run(self: Box<Self>) {
        let Job {
            body, completion, ..
        } = *self;
        completion(capture(body));
    }
}

pub(crate) struct Task {
    job: Box<dyn Runnable>,
    /// Fiber already registered for this work by the spawner, if any.
    fiber: Option<FiberId>,
}

impl Task {
    pub fn new<T, F, C>(body: F, completion: C) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
        C: FnOnce(Result<T, BridgeError>) + Send + 'static,
    {
        Task {
            job: Box::new(Job {
                body,
                completion,
                _output: PhantomData,
            }),
            fiber: None,
        }
    }

    /// Attach the fiber the spawner registered. The scheduler then tracks
    /// the work under that id instead of allocating one.
    pub fn with_fiber(mut self, id: FiberId) -> Self {
        self.fiber = Some(id);
        self
    }

    pub fn fiber(&self) -> Option<FiberId> {
        self.fiber
    }

    pub fn run(self) {
        self.job.run();
    }
}

/// Run user code, turning errors and panics into a `BridgeError` outcome.
pub(crate) fn capture<T, F>(body: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            let err = application_error(e);
            tracing::error!(error = %err, "task failed");
            Err(err)
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(panic = %msg, "task panicked");
            Err(BridgeError::Panicked(msg))
        }
    }
}

/// Error returned by user code. A `BridgeError` passed up with `?` keeps its kind.
pub(crate) fn application_error(e: BoxError) -> BridgeError {
    match e.downcast::<BridgeError>() {
        Ok(bridge) => *bridge,
        Err(e) => BridgeError::Application(e),
    }
}

/// Error reported by a native delivery callback.
pub(crate) fn native_error(e: BoxError) -> BridgeError {
    match e.downcast::<BridgeError>() {
        Ok(bridge) => *bridge,
        Err(e) => {
            tracing::error!(error = %e, "native delivery failed");
            BridgeError::NativeDelivery(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_value_passes_through() {
        assert_eq!(capture(|| Ok::<_, BoxError>(7)).unwrap(), 7);
    }

    #[test]
    fn error_becomes_application() {
        let err = capture(|| -> Result<(), BoxError> { Err("boom".into()) }).unwrap_err();
        assert!(matches!(err, BridgeError::Application(_)));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn bridge_error_keeps_kind() {
        let err = capture(|| -> Result<(), BoxError> { Err(BridgeError::Abandoned.into()) })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Abandoned));
    }

    #[test]
    fn panic_is_caught() {
        let err = capture(|| -> Result<(), BoxError> { panic!("kaput") }).unwrap_err();
        match err {
            BridgeError::Panicked(msg) => assert!(msg.contains("kaput")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn native_error_wraps_foreign_errors() {
        let err = native_error("refused".into());
        assert!(matches!(err, BridgeError::NativeDelivery(_)));
    }

    #[test]
    fn task_runs_completion() {
        let (tx, rx) = crossbeam_channel::unbounded();
        Task::new(|| Ok(5), move |r| tx.send(r.unwrap()).unwrap()).run();
        assert_eq!(rx.recv().unwrap(), 5);
    }

    #[test]
    fn dropped_task_drops_completion() {
        let (tx, rx) = crossbeam_channel::unbounded::<Result<i32, BridgeError>>();
        let task = Task::new(|| Ok(5), move |r| tx.send(r).unwrap());
        drop(task);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn registered_fiber_travels_with_task() {
        let id = FiberId::next();
        let task = Task::new(|| Ok(()), |_| {});
        assert_eq!(task.fiber(), None);
        assert_eq!(task.with_fiber(id).fiber(), Some(id));
    }
}

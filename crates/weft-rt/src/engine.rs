// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The native engine: where timers and I/O actually happen.
//!
//! Operations take a `Delivery` and return at once. The engine invokes the
//! delivery exactly once, later, from one of its own threads.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::delivery::Delivery;
use crate::error::BoxError;

pub trait NativeEngine: Send + Sync {
    /// Deliver `()` after `ms` milliseconds.
    fn sleep_ms(&self, delivery: Delivery<()>, ms: u64);

    /// Deliver the contents of the file at `path`.
    fn read_file_bytes(&self, delivery: Delivery<Vec<u8>>, path: PathBuf);
}

/// Engine backed by a multi-threaded tokio runtime.
pub struct TokioEngine {
    rt: Option<tokio::runtime::Runtime>,
}

impl TokioEngine {
    /// `workers` must be at least 1.
    pub fn new(workers: usize, thread_name_prefix: &str) -> io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name(format!("{}-native", thread_name_prefix))
            .enable_time()
            .build()?;
        Ok(Self { rt: Some(rt) })
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // Only `None` while dropping.
        if let Some(rt) = &self.rt {
            rt.spawn(fut);
        }
    }
}

impl NativeEngine for TokioEngine {
    fn sleep_ms(&self, delivery: Delivery<()>, ms: u64) {
        self.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            delivery.ok(());
        });
    }

    fn read_file_bytes(&self, delivery: Delivery<Vec<u8>>, path: PathBuf) {
        self.spawn(async move {
            delivery.deliver(tokio::fs::read(&path).await.map_err(BoxError::from));
        });
    }
}

impl Drop for TokioEngine {
    fn drop(&mut self) {
        // Never blocks, so the last handle may go away on any thread.
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

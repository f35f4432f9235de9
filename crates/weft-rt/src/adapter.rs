// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Boundary for client adapters (database, cache, pub-sub, HTTP, task queue).
//!
//! An adapter holds a native handle, issues bridge calls through it and
//! reshapes the raw values into its own types. `NativeClient` packages that
//! pattern so adapters only supply the operation and the reshaping.

use std::fmt;
use std::sync::OnceLock;

use crate::bridge;
use crate::delivery::Delivery;
use crate::error::{BoxError, BridgeError, UsageError};
use crate::event_loop::LoopFuture;
use crate::fiber::Fiber;

type Getter<H> = Box<dyn Fn() -> Option<H> + Send + Sync>;

/// Lazily acquired native handle plus the bridge call styles.
pub struct NativeClient<H> {
    name: String,
    getter: Getter<H>,
    handle: OnceLock<H>,
}

impl<H: 'static> NativeClient<H> {
    /// The handle is fetched from `getter` on first use. A `None` result is
    /// retried on the next call.
    pub fn new<G>(name: impl Into<String>, getter: G) -> Self
    where
        G: Fn() -> Option<H> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            getter: Box::new(getter),
            handle: OnceLock::new(),
        }
    }

    pub fn with_handle(name: impl Into<String>, handle: H) -> Self {
        let client = Self::new(name, || None);
        let _ = client.handle.set(handle);
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> Result<&H, UsageError> {
        if let Some(h) = self.handle.get() {
            return Ok(h);
        }
        match (self.getter)() {
            Some(h) => Ok(self.handle.get_or_init(|| h)),
            None => Err(UsageError::ClientUnavailable(self.name.clone())),
        }
    }

    /// Issue `op` and suspend the calling fiber until it delivers.
    pub fn call<R, T, Op, Sh>(&self, op: Op, reshape: Sh) -> Result<T, BridgeError>
    where
        R: Send + 'static,
        T: Send + 'static,
        Op: FnOnce(&H, Delivery<R>),
        Sh: FnOnce(R) -> Result<T, BoxError> + Send + 'static,
    {
        let h = self.handle()?;
        bridge::call(|d: Delivery<T>| op(h, d.reshaped(reshape)))
    }

    /// Issue `op` and return its fiber.
    pub fn call_deferred<R, T, Op, Sh>(&self, op: Op, reshape: Sh) -> Result<Fiber<T>, BridgeError>
    where
        R: Send + 'static,
        T: Send + 'static,
        Op: FnOnce(&H, Delivery<R>),
        Sh: FnOnce(R) -> Result<T, BoxError> + Send + 'static,
    {
        let h = self.handle()?;
        bridge::call_deferred(|d: Delivery<T>| op(h, d.reshaped(reshape)))
    }

    /// Issue `op` from the event loop and return an awaitable.
    pub fn call_async<R, T, Op, Sh>(&self, op: Op, reshape: Sh) -> Result<LoopFuture<T>, BridgeError>
    where
        R: Send + 'static,
        T: Send + 'static,
        Op: FnOnce(&H, Delivery<R>),
        Sh: FnOnce(R) -> Result<T, BoxError> + Send + 'static,
    {
        let h = self.handle()?;
        bridge::call_async(|d: Delivery<T>| op(h, d.reshaped(reshape)))
    }
}

impl<H> fmt::Debug for NativeClient<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeClient")
            .field("name", &self.name)
            .field("connected", &self.handle.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Stand-in for a native key-value connection.
    #[derive(Debug)]
    struct FakeKv {
        data: HashMap<String, Vec<u8>>,
    }

    impl FakeKv {
        fn get(&self, key: &str, delivery: Delivery<Option<Vec<u8>>>) {
            let value = self.data.get(key).cloned();
            thread::spawn(move || delivery.ok(value));
        }
    }

    fn kv() -> FakeKv {
        FakeKv {
            data: HashMap::from([("name".to_string(), b"weft".to_vec())]),
        }
    }

    #[test]
    fn missing_handle_is_usage_error() {
        let client: NativeClient<FakeKv> = NativeClient::new("kv", || None);
        assert_eq!(
            client.handle().unwrap_err(),
            UsageError::ClientUnavailable("kv".to_string())
        );
    }

    #[test]
    fn getter_runs_once_after_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let client = NativeClient::new("kv", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Some(kv())
        });
        client.handle().unwrap();
        client.handle().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn call_reshapes_raw_value() {
        let rt = Runtime::new(RuntimeConfig::default().set_native_workers(1)).unwrap();
        let sched = rt.start_scheduler().unwrap();
        let name = sched
            .block_on(|| {
                let client = NativeClient::with_handle("kv", kv());
                let name = client.call(
                    |h, d| h.get("name", d),
                    |raw: Option<Vec<u8>>| {
                        let bytes = raw.ok_or("missing key")?;
                        Ok(String::from_utf8(bytes)?)
                    },
                )?;
                Ok(name)
            })
            .unwrap();
        assert_eq!(name, "weft");
    }

    #[test]
    fn reshape_error_surfaces_from_call() {
        let rt = Runtime::new(RuntimeConfig::default().set_native_workers(1)).unwrap();
        let sched = rt.start_scheduler().unwrap();
        let err = sched
            .block_on(|| {
                let client = NativeClient::with_handle("kv", kv());
                let fiber = client.call_deferred(
                    |h, d| h.get("absent", d),
                    |raw: Option<Vec<u8>>| raw.ok_or_else(|| BoxError::from("missing key")),
                )?;
                Ok(fiber.join()?)
            })
            .unwrap_err();
        assert!(err.to_string().contains("missing key"));
    }
}

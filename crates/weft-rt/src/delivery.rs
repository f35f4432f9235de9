// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-use completion callback handed to native operations.

use std::fmt;

use crate::error::BoxError;

type Callback<T> = Box<dyn FnOnce(Result<T, BoxError>) + Send>;

/// Completion callback of one native operation.
///
/// `deliver` consumes the value, so it runs at most once. If the operation
/// drops it instead, the waiting side receives an error rather than
/// hanging.
pub struct Delivery<T> {
    callback: Option<Callback<T>>,
}

impl<T: 'static> Delivery<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<T, BoxError>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    pub fn deliver(mut self, outcome: Result<T, BoxError>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }

    pub fn ok(self, value: T) {
        self.deliver(Ok(value));
    }

    pub fn err(self, error: impl Into<BoxError>) {
        self.deliver(Err(error.into()));
    }

    /// A delivery for raw values of type `U`, converted by `reshape` before
    /// they reach this one.
    pub fn reshaped<U, F>(self, reshape: F) -> Delivery<U>
    where
        U: 'static,
        F: FnOnce(U) -> Result<T, BoxError> + Send + 'static,
    {
        Delivery::new(move |raw: Result<U, BoxError>| self.deliver(raw.and_then(reshape)))
    }
}

impl<T> Drop for Delivery<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err("native operation dropped its delivery without a result".into()));
        }
    }
}

impl<T> fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe<T: Send + 'static>() -> (Delivery<T>, crossbeam_channel::Receiver<Result<T, String>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let d = Delivery::new(move |r: Result<T, BoxError>| {
            tx.send(r.map_err(|e| e.to_string())).unwrap();
        });
        (d, rx)
    }

    #[test]
    fn delivers_once() {
        let (d, rx) = probe::<u32>();
        d.ok(4);
        assert_eq!(rx.recv().unwrap(), Ok(4));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn drop_delivers_error() {
        let (d, rx) = probe::<u32>();
        drop(d);
        assert!(rx.recv().unwrap().unwrap_err().contains("dropped"));
    }

    #[test]
    fn reshape_converts_raw_value() {
        let (d, rx) = probe::<usize>();
        let raw: Delivery<String> = d.reshaped(|s: String| Ok(s.len()));
        raw.ok("four".to_string());
        assert_eq!(rx.recv().unwrap(), Ok(4));
    }

    #[test]
    fn reshape_error_reaches_caller() {
        let (d, rx) = probe::<u8>();
        let raw: Delivery<String> =
            d.reshaped(|s: String| s.parse::<u8>().map_err(BoxError::from));
        raw.ok("x".to_string());
        assert!(rx.recv().unwrap().is_err());
    }

    #[test]
    fn errors_skip_reshape() {
        let (d, rx) = probe::<usize>();
        let raw: Delivery<String> = d.reshaped(|_| panic!("not called"));
        raw.err("refused");
        assert_eq!(rx.recv().unwrap(), Err("refused".to_string()));
    }
}

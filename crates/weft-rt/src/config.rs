// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults are usable as-is; `from_env` overlays `WEFT_*` variables.

use serde::Deserialize;
use thiserror::Error;

const ENV_NATIVE_WORKERS: &str = "WEFT_NATIVE_WORKERS";
const ENV_EVENT_LOOP: &str = "WEFT_EVENT_LOOP";
const ENV_THREAD_PREFIX: &str = "WEFT_THREAD_PREFIX";
const ENV_LOG: &str = "WEFT_LOG";

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got `{value}`")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Settings shared by every thread started from one `Runtime`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for the native engine. 0 picks the number of cores.
    pub native_workers: usize,
    /// Prefix for the names of every OS thread the runtime starts.
    pub thread_name_prefix: String,
    /// Start an event-loop thread together with the runtime.
    pub event_loop: bool,
    /// `tracing` filter directive used by `logging::init_from_config`.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            native_workers: 0,
            thread_name_prefix: "weft".to_string(),
            event_loop: false,
            log_filter: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn set_native_workers(mut self, n: usize) -> Self {
        self.native_workers = n;
        self
    }

    pub fn set_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn set_event_loop(mut self, enabled: bool) -> Self {
        self.event_loop = enabled;
        self
    }

    pub fn set_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Defaults overlaid with `WEFT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`. Unset keys keep their current value.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_NATIVE_WORKERS) {
            self.native_workers = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_NATIVE_WORKERS,
                expected: "a non-negative integer",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ENV_EVENT_LOOP) {
            self.event_loop = parse_flag(&v).ok_or(ConfigError::InvalidValue {
                var: ENV_EVENT_LOOP,
                expected: "a boolean (1/0, true/false, yes/no)",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ENV_THREAD_PREFIX) {
            self.thread_name_prefix = v;
        }
        if let Some(v) = lookup(ENV_LOG) {
            self.log_filter = v;
        }
        Ok(self)
    }

    /// Worker count with 0 resolved to the available parallelism.
    pub(crate) fn resolved_native_workers(&self) -> usize {
        if self.native_workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.native_workers
        }
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn overlay_reads_all_keys() {
        let cfg = RuntimeConfig::default()
            .overlay(env(&[
                ("WEFT_NATIVE_WORKERS", "3"),
                ("WEFT_EVENT_LOOP", "yes"),
                ("WEFT_THREAD_PREFIX", "app"),
                ("WEFT_LOG", "weft_rt=debug"),
            ]))
            .unwrap();
        assert_eq!(cfg.native_workers, 3);
        assert!(cfg.event_loop);
        assert_eq!(cfg.thread_name_prefix, "app");
        assert_eq!(cfg.log_filter, "weft_rt=debug");
    }

    #[test]
    fn overlay_keeps_unset_keys() {
        let base = RuntimeConfig::default().set_native_workers(2);
        let cfg = base.clone().overlay(env(&[])).unwrap();
        assert_eq!(cfg, base);
    }

    #[test]
    fn bad_worker_count() {
        let err = RuntimeConfig::default()
            .overlay(env(&[("WEFT_NATIVE_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "WEFT_NATIVE_WORKERS", .. }));
    }

    #[test]
    fn bad_flag() {
        let err = RuntimeConfig::default()
            .overlay(env(&[("WEFT_EVENT_LOOP", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("WEFT_EVENT_LOOP"));
    }

    #[test]
    fn deserialize_partial() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"event_loop": true}"#).unwrap();
        assert!(cfg.event_loop);
        assert_eq!(cfg.thread_name_prefix, "weft");
    }

    #[test]
    fn zero_workers_resolves() {
        assert!(RuntimeConfig::default().resolved_native_workers() >= 1);
        assert_eq!(RuntimeConfig::default().set_native_workers(5).resolved_native_workers(), 5);
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Optional `tracing` subscriber setup.
//!
//! The library only emits events; binaries and tests decide whether to
//! install a subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;

/// Install a global fmt subscriber with the given filter directive.
///
/// Returns `false` when a global subscriber was already installed or the
/// directive does not parse.
pub fn init(filter: &str) -> bool {
    let Ok(filter) = EnvFilter::try_new(filter) else {
        return false;
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

/// Install a subscriber using `RuntimeConfig::log_filter`.
pub fn init_from_config(config: &RuntimeConfig) -> bool {
    init(&config.log_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_is_rejected() {
        assert!(!init("weft_rt=notalevel"));
    }

    #[test]
    fn second_install_is_refused() {
        let _ = init("warn");
        assert!(!init("warn"));
    }
}

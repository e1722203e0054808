//! Process-wide tracing subscriber
//!
//! `RUST_LOG` wins when set; otherwise `GB_LOG` (default `info`) is used as
//! the filter directive. Safe to call any number of times.

use std::sync::OnceLock;

use greenbridge_core::env::env_get_str;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the fmt subscriber once
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(env_get_str("GB_LOG", "info")));

        // A host application may already own the global subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Test-friendly variant writing through the libtest capture
pub fn init_test() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(env_get_str("GB_LOG", "warn")));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

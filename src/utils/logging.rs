//! Logging Utilities
//!
//! env_logger setup with strict filtering of foreign crates.

use env_logger::{Builder, Env};
use log::LevelFilter;

const CRATE_TARGET: &str = "hwcodec_bridge";

/// Initialize console logging.
///
/// `RUST_LOG` still wins when set. Otherwise this crate logs at info and
/// everything else is held to warnings.
pub fn init_logging() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("warn"));
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_module(CRATE_TARGET, LevelFilter::Info);
    }
    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}

/// Initialize logging for tests. Safe to call from every test.
pub fn init_test_logging() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

//! Utility Functions
//!
//! Logging setup and timing helpers shared by the engine and adapters.

mod logging;
mod time;

pub use logging::*;
pub use time::*;

use std::path::PathBuf;

/// Get the crate's configuration directory
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hwcodec-bridge")
}

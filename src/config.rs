//! Engine Configuration
//!
//! Tunables for the decode engine, persisted as JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Result;

/// Decode engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    // === Output ===
    /// Keep decoded pictures in device memory and hand out references
    pub direct_rendering: bool,

    /// Allow audio streams to be decoded by the device
    pub enable_audio: bool,

    // === Timestamps ===
    /// Capacity of the reordering timestamp FIFO
    pub timestamp_fifo_capacity: usize,

    // === Device waits ===
    /// Timeout for a single input slot dequeue (ms)
    pub input_dequeue_timeout_ms: u64,

    /// Timeout for a single output dequeue (ms), `None` blocks until the device answers
    pub output_dequeue_timeout_ms: Option<u64>,

    // === Stall policy ===
    /// Continuous try-again time after which held zero-copy pictures are invalidated (ms)
    pub stall_invalidate_after_ms: u64,

    /// Continuous try-again time after which the engine aborts (ms)
    pub stall_abort_after_ms: u64,

    /// Longest time stop() waits for the output thread (ms)
    pub stop_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            direct_rendering: false,
            enable_audio: false,
            timestamp_fifo_capacity: 32,
            input_dequeue_timeout_ms: 10,
            output_dequeue_timeout_ms: None,
            stall_invalidate_after_ms: 400,
            stall_abort_after_ms: 2_000,
            stop_timeout_ms: 1_000,
        }
    }
}

impl EngineConfig {
    fn file_path() -> PathBuf {
        crate::utils::get_config_dir().join("engine.json")
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::file_path())
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::file_path())
    }

    /// Load settings from `path`, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.timestamp_fifo_capacity == 0 {
            anyhow::bail!("timestamp_fifo_capacity must be at least 1");
        }
        if self.input_dequeue_timeout_ms == 0 {
            anyhow::bail!("input_dequeue_timeout_ms must be at least 1");
        }
        if self.stall_abort_after_ms < self.stall_invalidate_after_ms {
            anyhow::bail!(
                "stall_abort_after_ms ({}) is shorter than stall_invalidate_after_ms ({})",
                self.stall_abort_after_ms,
                self.stall_invalidate_after_ms
            );
        }
        Ok(())
    }

    pub fn input_dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.input_dequeue_timeout_ms)
    }

    pub fn output_dequeue_timeout(&self) -> Option<Duration> {
        self.output_dequeue_timeout_ms.map(Duration::from_millis)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

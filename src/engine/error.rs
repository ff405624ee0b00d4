//! Engine errors

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;

/// Errors surfaced by the decode engine.
///
/// Transient device conditions (try-again, stream recoverable errors) are
/// absorbed by the engine and never appear here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported stream: {0}")]
    Unsupported(String),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("device input stalled for {0:?}")]
    Stalled(Duration),

    #[error("decode engine aborted")]
    Aborted,

    #[error("decode engine stopped")]
    Stopped,

    #[error("decoder not started")]
    NotStarted,
}

impl EngineError {
    /// True for errors after which the engine only accepts stop()
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Aborted | EngineError::Device(_) | EngineError::Stalled(_)
        )
    }
}

//! Input stall policy
//!
//! A device that keeps answering try-again to input dequeues is usually
//! waiting for output slots a consumer still holds. The policy first hands
//! held zero-copy pictures back, once, and gives up if the stall persists.

use std::time::Duration;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    /// Retry the dequeue
    Wait,
    /// Release every held zero-copy picture, then retry
    InvalidateInflight,
    /// Give up and abort the engine
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPolicy {
    pub invalidate_after: Duration,
    pub abort_after: Duration,
}

impl StallPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            invalidate_after: Duration::from_millis(config.stall_invalidate_after_ms),
            abort_after: Duration::from_millis(config.stall_abort_after_ms),
        }
    }

    /// Decide what to do after `elapsed` of continuous try-again.
    /// `invalidated` is whether pictures were already released in this stall.
    pub fn decide(&self, elapsed: Duration, invalidated: bool) -> StallAction {
        if elapsed >= self.abort_after {
            StallAction::Fatal
        } else if elapsed >= self.invalidate_after && !invalidated {
            StallAction::InvalidateInflight
        } else {
            StallAction::Wait
        }
    }
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

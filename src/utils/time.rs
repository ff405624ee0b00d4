//! Time Utilities
//!
//! Stall timing for blocked device queues and a sample-accurate audio clock.

use std::time::{Duration, Instant};

/// Convert a sample count at `rate` Hz into microseconds
pub fn samples_to_us(samples: u64, rate: u32) -> i64 {
    if rate == 0 {
        return 0;
    }
    (samples as u128 * 1_000_000 / rate as u128) as i64
}

/// Measures how long the device has refused an input slot.
///
/// The timer starts on the first try-again and is cleared as soon as a slot
/// is obtained.
#[derive(Debug, Default)]
pub struct StallTimer {
    since: Option<Instant>,
    attempts: u32,
}

impl StallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a try-again and return the total stall duration so far
    pub fn tick(&mut self) -> Duration {
        self.attempts += 1;
        match self.since {
            Some(since) => since.elapsed(),
            None => {
                self.since = Some(Instant::now());
                Duration::ZERO
            }
        }
    }

    pub fn reset(&mut self) {
        self.since = None;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_stalled(&self) -> bool {
        self.since.is_some()
    }
}

/// Output clock for decoded audio.
///
/// Dates are derived from a base timestamp plus the number of frames emitted
/// since, so rounding never accumulates.
#[derive(Debug, Clone)]
pub struct AudioClock {
    rate: u32,
    base: Option<i64>,
    frames: u64,
}

impl AudioClock {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            base: None,
            frames: 0,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Change the sample rate, keeping the current date as the new base
    pub fn set_rate(&mut self, rate: u32) {
        if rate == self.rate {
            return;
        }
        let date = self.date();
        self.rate = rate;
        self.base = date;
        self.frames = 0;
    }

    /// Restart counting from `date`
    pub fn set(&mut self, date: i64) {
        self.base = Some(date);
        self.frames = 0;
    }

    pub fn reset(&mut self) {
        self.base = None;
        self.frames = 0;
    }

    pub fn date(&self) -> Option<i64> {
        self.base.map(|base| base + samples_to_us(self.frames, self.rate))
    }

    /// Advance by `frames` samples and return the new date
    pub fn increment(&mut self, frames: u64) -> Option<i64> {
        self.base?;
        self.frames += frames;
        self.date()
    }
}

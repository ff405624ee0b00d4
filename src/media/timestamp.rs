//! Presentation timestamp FIFO
//!
//! Devices may emit pictures with timestamps they invented or reordered.
//! One slot is pushed per accepted input unit and one popped per produced
//! output, so the n-th output can be paired with the n-th input.

use std::collections::VecDeque;

/// Fixed-capacity ring of timestamps. `None` marks a slot whose output should
/// keep the device timestamp.
#[derive(Debug)]
pub struct TimestampFifo {
    slots: VecDeque<Option<i64>>,
    capacity: usize,
}

impl TimestampFifo {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a value, overwriting the oldest slot when full
    pub fn put(&mut self, ts: Option<i64>) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(ts);
    }

    /// Pop the oldest value. An empty FIFO yields `None`.
    pub fn pop(&mut self) -> Option<i64> {
        self.slots.pop_front().flatten()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

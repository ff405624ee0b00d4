//! Zero-copy picture tracking
//!
//! With direct rendering a decoded picture stays in a device output slot
//! and the caller receives a [`DirectBuffer`] referencing it. The table
//! records which slots are held so that a flush or stall can hand every
//! slot back to the device, after which late releases from callers are
//! ignored.
//!
//! The table has its own lock. Callers release pictures from arbitrary
//! threads without touching the engine lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::device::DeviceBinding;

pub struct InflightTable {
    /// Device output index -> token of the live handle
    entries: Mutex<HashMap<usize, u64>>,
    next_token: AtomicU64,
    device: Arc<dyn DeviceBinding>,
}

impl InflightTable {
    pub fn new(device: Arc<dyn DeviceBinding>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            device,
        })
    }

    /// Register a held output slot and return its handle.
    ///
    /// A stale entry for the same index is superseded, so the table never
    /// holds two live entries for one slot.
    pub fn insert(self: &Arc<Self>, index: usize) -> Arc<DirectBuffer> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Some(stale) = self.entries.lock().insert(index, token) {
            warn!("Output slot {} handed out again while held (token {})", index, stale);
        }
        Arc::new(DirectBuffer {
            index,
            token,
            table: Arc::downgrade(self),
            released: AtomicBool::new(false),
        })
    }

    /// Release one slot if `token` still owns it. Returns false for late releases.
    fn release(&self, index: usize, token: u64, render: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(&index) != Some(&token) {
            return false;
        }
        entries.remove(&index);
        // still under the table lock so invalidate_all cannot release it twice
        if let Err(e) = self.device.release_output(index, render) {
            warn!("Failed to release output slot {}: {}", index, e);
        }
        true
    }

    /// Hand every held slot back to the device without rendering.
    /// Returns how many slots were released.
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        for (index, _) in entries.drain() {
            if let Err(e) = self.device.release_output(index, false) {
                warn!("Failed to release output slot {}: {}", index, e);
            }
        }
        if count > 0 {
            debug!("Invalidated {} in-flight pictures", count);
        }
        count
    }

    /// Forget every held slot without calling the device, for a device
    /// that reclaims its slots when stopped.
    pub fn detach_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    fn is_live(&self, index: usize, token: u64) -> bool {
        self.entries.lock().get(&index) == Some(&token)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.entries.lock().contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for InflightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTable")
            .field("entries", &*self.entries.lock())
            .finish()
    }
}

/// Reference to a picture held in a device output slot.
///
/// Dropping the last reference returns the slot without rendering.
pub struct DirectBuffer {
    index: usize,
    token: u64,
    table: Weak<InflightTable>,
    released: AtomicBool,
}

impl DirectBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Render the picture and return the slot. Returns false if the picture
    /// was already invalidated or released.
    pub fn render(&self) -> bool {
        self.finish(true)
    }

    /// Return the slot without rendering
    pub fn discard(&self) -> bool {
        self.finish(false)
    }

    /// True while the slot still belongs to this handle
    pub fn is_valid(&self) -> bool {
        !self.released.load(Ordering::Acquire)
            && self
                .table
                .upgrade()
                .map_or(false, |table| table.is_live(self.index, self.token))
    }

    fn finish(&self, render: bool) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.table.upgrade() {
            Some(table) => table.release(self.index, self.token, render),
            None => false,
        }
    }
}

impl Drop for DirectBuffer {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl std::fmt::Debug for DirectBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBuffer")
            .field("index", &self.index)
            .field("token", &self.token)
            .finish()
    }
}

//! Codec-specific data queue
//!
//! Parameter-set blobs the device must see before ordinary input. Entries
//! are consumed through a cursor; a flush rewinds it so the whole set is
//! delivered again to the freshly flushed device.

use bytes::Bytes;

/// One codec-config blob. Always queued to the device as config data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsdEntry {
    data: Bytes,
}

impl CsdEntry {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_config(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct CsdQueue {
    entries: Vec<CsdEntry>,
    cursor: usize,
}

impl CsdQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `blobs` is byte-for-byte the stored set
    pub fn matches(&self, blobs: &[Bytes]) -> bool {
        self.entries.len() == blobs.len()
            && self
                .entries
                .iter()
                .zip(blobs)
                .all(|(entry, blob)| entry.data == *blob)
    }

    /// Replace the stored set unless it is identical to `blobs`.
    ///
    /// Returns true when the contents changed. A replacement restarts
    /// delivery from the first entry.
    pub fn replace_if_changed(&mut self, blobs: Vec<Bytes>) -> bool {
        if self.matches(&blobs) {
            return false;
        }
        self.entries = blobs.into_iter().map(CsdEntry::new).collect();
        self.cursor = 0;
        true
    }

    /// Entry waiting to be sent, if any
    pub fn next_pending(&self) -> Option<&CsdEntry> {
        self.entries.get(self.cursor)
    }

    pub fn has_pending(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Mark the entry at the cursor as delivered
    pub fn mark_sent(&mut self) {
        if self.cursor < self.entries.len() {
            self.cursor += 1;
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> &[CsdEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

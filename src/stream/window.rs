// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The reorder window shared by both streaming directions (spec §4.7, glossary "Window"): a
//! sequence-number keyed buffer that releases a contiguous run as soon as the next expected
//! number arrives. Byte-credit back-pressure is tracked separately by [`super::input`] and
//! [`super::output`], since the two directions credit different positions.

use std::collections::BTreeMap;

pub struct ReorderWindow<T> {
    next_expected: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderWindow<T> {
    pub fn new() -> Self {
        ReorderWindow {
            next_expected: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Inserts a contiguous batch of items starting at `base` and returns, tagged with its
    /// sequence number, every item now ready for delivery, in order. A batch lets one wire
    /// payload carry several sequence numbers at once (spec §4.7: `TryPull` "greedily packs
    /// attachments").
    pub fn insert_batch(&mut self, base: u64, items: Vec<T>) -> Vec<(u64, T)> {
        for (offset, item) in items.into_iter().enumerate() {
            self.pending.insert(base + offset as u64, item);
        }
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_expected) {
            ready.push((self.next_expected, item));
            self.next_expected += 1;
        }
        ready
    }
}

impl<T> Default for ReorderWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

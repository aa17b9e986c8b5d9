//! Out-of-order holding area shared by the SR receiver and the connection
//! receiver.
//!
//! Payloads that arrive ahead of the next expected sequence are parked here
//! keyed by their sequence number, then released in order once the gap in
//! front of them closes.  The buffer does not interpret sequence numbers;
//! the caller supplies how far each released payload advances the cursor
//! (`+1` per frame for SR, `+len` per segment for the byte stream).

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ReorderBuffer {
    slots: BTreeMap<u32, Vec<u8>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `payload` at `seq`.  Returns `false` (and keeps the first copy)
    /// when `seq` is already buffered.
    pub fn insert(&mut self, seq: u32, payload: Vec<u8>) -> bool {
        if self.slots.contains_key(&seq) {
            return false;
        }
        self.slots.insert(seq, payload);
        true
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.slots.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Release the contiguous run starting at `*next`.
    ///
    /// After each released payload `*next` is advanced by `step(payload)`.
    pub fn drain_from<F>(&mut self, next: &mut u32, step: F) -> Vec<Vec<u8>>
    where
        F: Fn(&[u8]) -> u32,
    {
        let mut out = Vec::new();
        while let Some(payload) = self.slots.remove(next) {
            *next = next.wrapping_add(step(&payload));
            out.push(payload);
        }
        out
    }

    /// Drop every entry for which `keep` returns `false`.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(u32) -> bool,
    {
        self.slots.retain(|seq, _| keep(*seq));
    }
}

//! Monotonic store-local id generation.

use std::cell::Cell;

/// Hands out store-local ids for proxies and transactions.
#[derive(Debug)]
pub struct Sequencer {
    start: u64,
    current: Cell<u64>,
}

impl Sequencer {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            current: Cell::new(start.saturating_sub(1)),
        }
    }

    /// Next id. The first call returns the configured start value.
    pub fn next_id(&self) -> u64 {
        let next = self.current.get() + 1;
        self.current.set(next);
        next
    }

    /// The last id handed out.
    pub fn current(&self) -> u64 {
        self.current.get()
    }

    /// Make sure ids handed out later are greater than `seen`.
    pub fn update(&self, seen: u64) {
        if seen > self.current.get() {
            self.current.set(seen);
        }
    }

    pub fn reset(&self) {
        self.current.set(self.start.saturating_sub(1));
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(1)
    }
}

//! Bounded FIFO of build numbers waiting for the single build slot.

use std::collections::VecDeque;

/// Builds waiting to run, oldest first.
#[derive(Debug)]
pub struct BuildQueue {
    items: VecDeque<u64>,
    capacity: usize,
}

impl BuildQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether another build fits once `reserved` admitted submissions have
    /// been placed. With `slot_free`, one of them will take the build slot
    /// instead of a queue entry.
    pub fn has_room(&self, reserved: usize, slot_free: bool) -> bool {
        self.items.len() + reserved < self.capacity + usize::from(slot_free)
    }

    /// Append `build_number`. Hands it back when the queue is full.
    pub fn push(&mut self, build_number: u64) -> Result<(), u64> {
        if self.items.len() >= self.capacity {
            return Err(build_number);
        }
        self.items.push_back(build_number);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.items.pop_front()
    }

    /// Waiting build numbers, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().copied()
    }

    /// Zero-based position of `build_number` in the queue.
    pub fn position(&self, build_number: u64) -> Option<usize> {
        self.items.iter().position(|n| *n == build_number)
    }
}

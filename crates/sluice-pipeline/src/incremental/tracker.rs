//! Safe position tracking under out-of-order completion

use std::collections::VecDeque;

use crate::position::Position;

#[derive(Debug)]
struct Slot {
    position: Position,
    done: bool,
}

/// Tracks dispatched events and the highest position below which every
/// event is applied.
///
/// Events are registered in stream order and may complete in any order.
/// The safe position only moves over a contiguous prefix of completed
/// events, so it never passes an event that is still in flight.
#[derive(Debug)]
pub struct PositionTracker {
    /// Sequence number of `slots[0]`
    base: u64,
    slots: VecDeque<Slot>,
    safe: Option<Position>,
}

impl PositionTracker {
    /// Tracker starting at `safe` (the resume position, if any)
    pub fn new(safe: Option<Position>) -> Self {
        Self {
            base: 0,
            slots: VecDeque::new(),
            safe,
        }
    }

    /// Register the next dispatched event; returns its sequence number
    pub fn register(&mut self, position: Position) -> u64 {
        let seq = self.base + self.slots.len() as u64;
        self.slots.push_back(Slot {
            position,
            done: false,
        });
        seq
    }

    /// Mark `seq` applied. Returns the new safe position when it advanced.
    pub fn complete(&mut self, seq: u64) -> Option<Position> {
        let idx = seq.checked_sub(self.base)? as usize;
        self.slots.get_mut(idx)?.done = true;

        let mut advanced = None;
        while self.slots.front().is_some_and(|s| s.done) {
            if let Some(slot) = self.slots.pop_front() {
                advanced = Some(slot.position);
                self.base += 1;
            }
        }
        if let Some(position) = &advanced {
            self.safe = Some(position.clone());
        }
        advanced
    }

    /// Events registered and not yet covered by the safe position
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// Highest position with every predecessor applied
    pub fn safe(&self) -> Option<&Position> {
        self.safe.as_ref()
    }
}

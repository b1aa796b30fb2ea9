//! Weighted peer selection.
//!
//! Every peer with at least one connected node owns a contiguous slot of the `[0, count)`
//! range, sized by its proof score. Drawing a uniform value in that range selects a peer with
//! probability proportional to its score. Releasing a slot in the middle leaves a hole
//! (fragmentation) until the slots are compacted.

use crate::types::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    start: u64,
    score: u64,
    peer: Option<PeerId>,
}

impl Slot {
    pub fn new(start: u64, score: u64, peer: PeerId) -> Self {
        Self {
            start,
            score,
            peer: Some(peer),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn score(&self) -> u64 {
        self.score
    }

    pub fn stop(&self) -> u64 {
        self.start + self.score
    }

    /// Owner of the slot (`None` once released).
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn contains(&self, value: u64) -> bool {
        self.start <= value && value < self.stop()
    }
}

/// The slot table.
#[derive(Clone, Debug, Default)]
pub struct Slots {
    slots: Vec<Slot>,
    count: u64,
    fragmentation: u64,
}

impl Slots {
    /// Size of the selection range.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Total score of released slots still occupying the range.
    pub fn fragmentation(&self) -> u64 {
        self.fragmentation
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Append a slot for `peer`, returning its index.
    pub fn allocate(&mut self, peer: PeerId, score: u64) -> usize {
        self.slots.push(Slot::new(self.count, score, peer));
        self.count += score;
        self.slots.len() - 1
    }

    /// Release the slot at `index`.
    pub fn release(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        slot.peer = None;
        self.fragmentation += slot.score;

        // Released slots at the end are simply dropped.
        while let Some(last) = self.slots.last() {
            if last.peer.is_some() {
                break;
            }
            self.count -= last.score;
            self.fragmentation -= last.score;
            self.slots.pop();
        }
    }

    /// Remove every released slot. Returns the new index of each remaining peer.
    pub fn compact(&mut self) -> Vec<(PeerId, usize)> {
        let mut moved = Vec::with_capacity(self.slots.len());
        let mut compacted = Vec::with_capacity(self.slots.len());
        let mut count = 0;
        for slot in &self.slots {
            let Some(peer) = slot.peer else {
                continue;
            };
            moved.push((peer, compacted.len()));
            compacted.push(Slot::new(count, slot.score, peer));
            count += slot.score;
        }
        self.slots = compacted;
        self.count = count;
        self.fragmentation = 0;
        moved
    }

    /// Peer owning `value`, if the value falls in an allocated slot.
    pub fn select(&self, value: u64) -> Option<PeerId> {
        let index = self.slots.partition_point(|slot| slot.stop() <= value);
        self.slots
            .get(index)
            .filter(|slot| slot.contains(value))
            .and_then(|slot| slot.peer)
    }
}

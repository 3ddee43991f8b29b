//! Probe sequences over a power-of-two slot array and the tombstone-aware
//! scan that walks them.
//!
//! The scan is a pure function of a table snapshot: slot classification is
//! supplied by the caller, which knows the current markers.

use thiserror::Error;

/// Order in which candidate slots are visited.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ProbeStrategy {
    /// Constant step of one.
    Linear,
    /// Odd, hash-derived step. Odd steps are coprime with a power-of-two
    /// capacity, so every slot is visited exactly once.
    #[default]
    DoubleHash,
}

/// What a visited slot holds relative to the probed key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotClass {
    Match,
    Free,
    Tombstone,
    /// Holds some other key.
    Occupied,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanOutcome {
    Present {
        index: usize,
    },
    Absent {
        /// Free slot that ended the scan.
        free: usize,
        /// First tombstone passed on the way, if any.
        first_tombstone: Option<usize>,
    },
}

impl ScanOutcome {
    /// Where an insert of the absent key goes: the first tombstone seen,
    /// otherwise the free slot that ended the scan.
    pub fn insertion_slot(&self) -> Option<usize> {
        match self {
            ScanOutcome::Present { .. } => None,
            ScanOutcome::Absent {
                free,
                first_tombstone,
            } => Some(first_tombstone.unwrap_or(*free)),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ScanOutcome::Present { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The load policy let the table fill up; this is never a recoverable
    /// condition for the caller.
    #[error("probe sequence exhausted all {capacity} slots without reaching a free slot")]
    Exhausted { capacity: usize },
}

/// Deterministic sequence of slot indices for one hash.
#[derive(Clone, Debug)]
pub struct ProbeSequence {
    mask: usize,
    index: usize,
    step: usize,
    remaining: usize,
}

impl Iterator for ProbeSequence {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let i = self.index;
        self.index = (self.index + self.step) & self.mask;
        self.remaining -= 1;
        Some(i)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ProbeSequence {}

#[derive(Copy, Clone, Debug, Default)]
pub struct ProbeSequenceEngine {
    strategy: ProbeStrategy,
}

impl ProbeSequenceEngine {
    pub fn new(strategy: ProbeStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ProbeStrategy {
        self.strategy
    }

    /// Candidate slots for `hash` in a table of `capacity` slots.
    /// `capacity` must be a power of two.
    pub fn sequence(&self, hash: u64, capacity: usize) -> ProbeSequence {
        debug_assert!(capacity.is_power_of_two());
        let mask = capacity - 1;
        let step = match self.strategy {
            ProbeStrategy::Linear => 1,
            ProbeStrategy::DoubleHash => ((hash >> 32) as usize | 1) & mask,
        };
        ProbeSequence {
            mask,
            index: hash as usize & mask,
            step,
            remaining: capacity,
        }
    }

    /// Walks the sequence until the key or a free slot is found. Tombstones
    /// are skipped, the first one is remembered as the insertion point.
    pub fn scan<F>(
        &self,
        hash: u64,
        capacity: usize,
        mut classify: F,
    ) -> Result<ScanOutcome, ProbeError>
    where
        F: FnMut(usize) -> SlotClass,
    {
        let mut first_tombstone = None;
        for index in self.sequence(hash, capacity) {
            match classify(index) {
                SlotClass::Match => return Ok(ScanOutcome::Present { index }),
                SlotClass::Free => {
                    return Ok(ScanOutcome::Absent {
                        free: index,
                        first_tombstone,
                    })
                }
                SlotClass::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                SlotClass::Occupied => {}
            }
        }
        Err(ProbeError::Exhausted { capacity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Invariant: every strategy visits each slot exactly once.
    #[test]
    fn sequences_are_total_permutations() {
        for strategy in [ProbeStrategy::Linear, ProbeStrategy::DoubleHash] {
            let engine = ProbeSequenceEngine::new(strategy);
            for capacity in [1usize, 2, 8, 64] {
                for hash in [0u64, 1, 0xDEAD_BEEF_0000_0007, u64::MAX] {
                    let seen: Vec<usize> = engine.sequence(hash, capacity).collect();
                    let distinct: BTreeSet<usize> = seen.iter().copied().collect();
                    assert_eq!(seen.len(), capacity);
                    assert_eq!(distinct.len(), capacity, "{strategy:?} cap {capacity}");
                }
            }
        }
    }

    /// Invariant: two sequences for the same input are identical.
    #[test]
    fn sequences_are_reproducible() {
        let engine = ProbeSequenceEngine::default();
        let a: Vec<usize> = engine.sequence(0x1234_5678_9ABC, 32).collect();
        let b: Vec<usize> = engine.sequence(0x1234_5678_9ABC, 32).collect();
        assert_eq!(a, b);
    }

    /// Invariant: a scan stops on the first match.
    #[test]
    fn scan_finds_match_past_tombstones() {
        let engine = ProbeSequenceEngine::new(ProbeStrategy::Linear);
        let slots = [SlotClass::Tombstone, SlotClass::Occupied, SlotClass::Match, SlotClass::Free];
        let out = engine.scan(0, 4, |i| slots[i]).unwrap();
        assert_eq!(out, ScanOutcome::Present { index: 2 });
        assert_eq!(out.insertion_slot(), None);
    }

    /// Invariant: an absent key's insertion point is the first tombstone seen,
    /// or the terminating free slot when no tombstone was passed.
    #[test]
    fn scan_absent_reports_first_tombstone() {
        let engine = ProbeSequenceEngine::new(ProbeStrategy::Linear);
        let slots = [
            SlotClass::Occupied,
            SlotClass::Tombstone,
            SlotClass::Tombstone,
            SlotClass::Free,
        ];
        let out = engine.scan(0, 4, |i| slots[i]).unwrap();
        assert_eq!(
            out,
            ScanOutcome::Absent {
                free: 3,
                first_tombstone: Some(1)
            }
        );
        assert_eq!(out.insertion_slot(), Some(1));

        let clean = [SlotClass::Occupied, SlotClass::Free, SlotClass::Free, SlotClass::Free];
        let out = engine.scan(0, 4, |i| clean[i]).unwrap();
        assert_eq!(out.insertion_slot(), Some(1));
    }

    /// Invariant: a table without free slots is a fatal error, even when it
    /// holds tombstones.
    #[test]
    fn scan_without_free_slot_is_exhausted() {
        let engine = ProbeSequenceEngine::default();
        let res = engine.scan(7, 8, |i| {
            if i % 2 == 0 {
                SlotClass::Occupied
            } else {
                SlotClass::Tombstone
            }
        });
        assert_eq!(res, Err(ProbeError::Exhausted { capacity: 8 }));
    }
}

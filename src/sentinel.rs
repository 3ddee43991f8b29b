//! Free/removed markers for integral and floating-point key domains.
//!
//! Markers are ordinary values of the key domain. When a key equal to a
//! marker has to be stored, the marker moves to another value that no stored
//! key and no other marker uses; the owner of the slot array then rewrites
//! every slot holding the old marker (see [`Rebinding`]).
//!
//! Reference domains never get an allocator: null and a removed singleton
//! are outside the key space by construction.

use crate::domain::{Domain, Perturbation, SentinelPolicy, Width};
use hashbrown::HashSet;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Marker {
    Free,
    Removed,
}

/// Per-table marker values.
///
/// Invariant: `free != removed` and neither equals a stored key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentinelState {
    free: u64,
    /// Only tables that support removal have a removed marker.
    removed: Option<u64>,
    rebindings: u64,
}

impl SentinelState {
    pub fn free(&self) -> u64 {
        self.free
    }

    pub fn removed(&self) -> Option<u64> {
        self.removed
    }

    /// Number of marker moves since the table was created.
    pub fn rebindings(&self) -> u64 {
        self.rebindings
    }
}

/// A marker move the slot array must mirror.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Rebinding {
    pub marker: Marker,
    pub old: u64,
    pub new: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SentinelError {
    #[error("no unused {bits}-bit value left for the {marker:?} marker ({in_use} values in use)")]
    DomainExhausted {
        marker: Marker,
        bits: u32,
        in_use: usize,
    },
}

#[derive(Clone, Debug)]
pub struct SentinelAllocator {
    width: Width,
    perturbation: Perturbation,
    state: SentinelState,
}

impl SentinelAllocator {
    /// Allocator for an in-band key domain; `None` for reference domains.
    pub fn for_domain(domain: &Domain, with_removed: bool) -> Option<Self> {
        let width = domain.width()?;
        match domain.strategy().sentinel_policy() {
            SentinelPolicy::InBand {
                free,
                removed,
                perturbation,
            } => Some(Self {
                width,
                perturbation,
                state: SentinelState {
                    free,
                    removed: with_removed.then_some(removed),
                    rebindings: 0,
                },
            }),
            SentinelPolicy::OutOfBand => None,
        }
    }

    pub fn current_free(&self) -> u64 {
        self.state.free
    }

    pub fn current_removed(&self) -> Option<u64> {
        self.state.removed
    }

    pub fn state(&self) -> &SentinelState {
        &self.state
    }

    pub fn marker_of(&self, bits: u64) -> Option<Marker> {
        if bits == self.state.free {
            Some(Marker::Free)
        } else if Some(bits) == self.state.removed {
            Some(Marker::Removed)
        } else {
            None
        }
    }

    pub fn is_marker(&self, bits: u64) -> bool {
        self.marker_of(bits).is_some()
    }

    /// Consulted before `key` is stored. `in_use` holds every stored key plus
    /// `key` itself. Returns the marker move to apply, if `key` was a marker.
    pub fn on_key_equals(
        &mut self,
        key: u64,
        in_use: &HashSet<u64>,
    ) -> Result<Option<Rebinding>, SentinelError> {
        let Some(marker) = self.marker_of(key) else {
            return Ok(None);
        };
        let other = match marker {
            Marker::Free => self.state.removed,
            Marker::Removed => Some(self.state.free),
        };
        let new = self
            .replacement(key, other, in_use)
            .ok_or(SentinelError::DomainExhausted {
                marker,
                bits: self.width.bits(),
                in_use: in_use.len(),
            })?;
        match marker {
            Marker::Free => self.state.free = new,
            Marker::Removed => self.state.removed = Some(new),
        }
        self.state.rebindings += 1;
        tracing::debug!(?marker, old = key, new, "sentinel marker rebound");
        Ok(Some(Rebinding {
            marker,
            old: key,
            new,
        }))
    }

    /// Distinct candidate values, nearest perturbation first.
    fn candidates(&self, from: u64) -> impl Iterator<Item = u64> {
        let mask = self.width.mask();
        let first = match self.perturbation {
            Perturbation::Decrement => from.wrapping_sub(1) & mask,
            Perturbation::SignFlipThenDecrement => from ^ self.width.sign_bit(),
        };
        core::iter::successors(Some(first), move |c| Some(c.wrapping_sub(1) & mask))
    }

    fn replacement(&self, key: u64, other: Option<u64>, in_use: &HashSet<u64>) -> Option<u64> {
        // At most |in_use| + 2 values are forbidden, so that many distinct
        // candidates plus one always contain a valid value if the domain does.
        let limit = self
            .width
            .cardinality()
            .min(in_use.len() as u128 + 3) as usize;
        self.candidates(key)
            .take(limit)
            .find(|c| *c != key && Some(*c) != other && !in_use.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u8_allocator(with_removed: bool) -> SentinelAllocator {
        SentinelAllocator::for_domain(&Domain::int(Width::W8, false), with_removed).unwrap()
    }

    /// Invariant: keys that are not markers leave the state untouched.
    #[test]
    fn non_marker_key_is_a_no_op() {
        let mut a = u8_allocator(true);
        let before = a.state().clone();
        let in_use: HashSet<u64> = [5u64].into_iter().collect();
        assert_eq!(a.on_key_equals(5, &in_use), Ok(None));
        assert_eq!(a.state(), &before);
    }

    /// Invariant: with 254 of 256 byte values in use (the colliding key
    /// included), the free marker moves to one of the two unused values.
    #[test]
    fn rebinds_into_last_two_values() {
        let mut a = u8_allocator(false);
        let free = a.current_free();
        let spare = [free.wrapping_add(7) & 0xFF, free.wrapping_add(100) & 0xFF];
        let in_use: HashSet<u64> = (0u64..256).filter(|v| !spare.contains(v)).collect();
        assert_eq!(in_use.len(), 254);
        assert!(in_use.contains(&free));

        let r = a.on_key_equals(free, &in_use).unwrap().expect("free marker collided");
        assert_eq!(r.marker, Marker::Free);
        assert_eq!(r.old, free);
        assert!(spare.contains(&r.new), "rebound to {}", r.new);
        assert_eq!(a.current_free(), r.new);
        assert_eq!(a.state().rebindings(), 1);
    }

    /// Invariant: rebinding fails with a capacity error when the domain has no
    /// unused value left.
    #[test]
    fn rebinding_exhausts_byte_domain() {
        let mut a = u8_allocator(false);
        let free = a.current_free();
        let in_use: HashSet<u64> = (0u64..256).collect();
        let err = a.on_key_equals(free, &in_use).unwrap_err();
        assert_eq!(
            err,
            SentinelError::DomainExhausted {
                marker: Marker::Free,
                bits: 8,
                in_use: 256
            }
        );
        assert_eq!(a.current_free(), free, "state unchanged on failure");
    }

    /// Invariant: a moved marker never lands on the other marker.
    #[test]
    fn rebinding_avoids_other_marker() {
        let mut a = u8_allocator(true);
        let free = a.current_free();
        let removed = a.current_removed().unwrap();
        // Leave only `removed` and one other value unused by keys.
        let last = free.wrapping_add(50) & 0xFF;
        let in_use: HashSet<u64> = (0u64..256).filter(|v| *v != removed && *v != last).collect();
        let r = a.on_key_equals(free, &in_use).unwrap().unwrap();
        assert_eq!(r.new, last);
        assert_ne!(a.current_free(), a.current_removed().unwrap());
    }

    #[test]
    fn removed_marker_rebinds_by_decrement() {
        let mut a = u8_allocator(true);
        let removed = a.current_removed().unwrap();
        let in_use: HashSet<u64> = [removed].into_iter().collect();
        let r = a.on_key_equals(removed, &in_use).unwrap().unwrap();
        assert_eq!(r.marker, Marker::Removed);
        // removed - 1 is the free marker, so the next decrement wins.
        assert_eq!(a.current_free(), removed - 1);
        assert_eq!(r.new, removed - 2);
    }

    /// Invariant: floating markers try the sign-flipped pattern first.
    #[test]
    fn float_marker_flips_sign_first() {
        let mut a = SentinelAllocator::for_domain(&Domain::float64(), true).unwrap();
        let free = a.current_free();
        let in_use: HashSet<u64> = [free].into_iter().collect();
        let r = a.on_key_equals(free, &in_use).unwrap().unwrap();
        assert_eq!(r.new, free ^ (1 << 63));
    }

    #[test]
    fn reference_domains_have_no_allocator() {
        assert!(SentinelAllocator::for_domain(&Domain::reference(true), true).is_none());
    }
}

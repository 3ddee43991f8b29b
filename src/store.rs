//! Slot storage behind a [`SentinelTable`](crate::SentinelTable).
//!
//! Keys live in one array in their stored form. A slot is free or
//! tombstoned when it holds the current free/removed marker:
//! - numeric keys: the [`SentinelAllocator`]'s marker bit patterns;
//! - reference keys: null for free, a per-store singleton (compared by
//!   pointer) for removed.
//!
//! A null reference key never enters the array; it has a dedicated slot.
//! The store owns the load policy: after every insert at least one free slot
//! remains, which is what the probe scan relies on.

use crate::domain::{Datum, Domain, DomainStrategy};
use crate::probe::{ProbeError, ProbeSequenceEngine, ProbeStrategy, ScanOutcome, SlotClass};
use crate::sentinel::{Rebinding, SentinelAllocator, SentinelError, SentinelState};
use core::cell::Cell;
use core::hash::{BuildHasher, Hash, Hasher};
use hashbrown::HashSet;
use std::collections::hash_map::RandomState;
use std::rc::Rc;
use thiserror::Error;

/// Position of an entry: a slot of the array or the dedicated null slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlotIndex {
    Table(usize),
    Null,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("this store has no removed marker")]
    RemovalUnsupported,
    #[error("key sets store no values")]
    NoValues,
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
}

/// Counters kept behind `Cell` so read paths can update them.
#[derive(Debug, Default)]
struct Counters {
    scans: Cell<u64>,
    rehashes: Cell<u64>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    /// Probe scans started, by any operation.
    pub scans: u64,
    pub rehashes: u64,
    pub rebindings: u64,
}

/// Construction parameters of a [`SlotStore`].
#[derive(Clone, Debug)]
pub struct StoreLayout {
    pub key: Domain,
    pub value: Option<Domain>,
    /// Whether removal (and thus a removed marker) is supported.
    pub removable: bool,
    pub capacity: usize,
    pub max_load: f64,
    pub probe: ProbeStrategy,
    /// Presented result of a miss; the value domain's default when unset.
    pub default_value: Option<Datum>,
}

/// Hashes the stored form of a key.
struct StoredKey<'a>(&'a Datum);

impl Hash for StoredKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.0 {
            Datum::Bits(b) => b.hash(state),
            Datum::Ref(Some(s)) => s.hash(state),
            Datum::Ref(None) => 0u8.hash(state),
            Datum::Int(v) => v.hash(state),
            Datum::Float(f) => f.to_bits().hash(state),
            Datum::Bool(b) => b.hash(state),
        }
    }
}

pub struct SlotStore<S = RandomState> {
    key: Domain,
    value: Option<Domain>,
    keys: Vec<Datum>,
    values: Option<Vec<Datum>>,
    null_value: Option<Datum>,
    /// Live entries in the array, the null slot excluded.
    live: usize,
    tombstones: usize,
    markers: Option<SentinelAllocator>,
    /// Removed marker of reference keys.
    removed_ref: Option<Rc<str>>,
    default_value: Datum,
    max_load: f64,
    probe: ProbeSequenceEngine,
    hasher: S,
    counters: Counters,
}

impl<S: BuildHasher> SlotStore<S> {
    pub fn new(layout: StoreLayout, hasher: S) -> Self {
        let markers = SentinelAllocator::for_domain(&layout.key, layout.removable);
        let removed_ref = (markers.is_none() && layout.removable).then(|| Rc::from("\u{0}removed"));
        let capacity = layout.capacity.next_power_of_two().max(4);
        let default_value = layout.default_value.unwrap_or_else(|| {
            layout
                .value
                .map_or(Datum::Bool(false), |d| d.strategy().default_value())
        });
        let mut store = Self {
            key: layout.key,
            value: layout.value,
            keys: Vec::new(),
            values: None,
            null_value: None,
            live: 0,
            tombstones: 0,
            markers,
            removed_ref,
            default_value,
            max_load: layout.max_load,
            probe: ProbeSequenceEngine::new(layout.probe),
            hasher,
            counters: Counters::default(),
        };
        store.reset(capacity);
        store
    }

    fn reset(&mut self, capacity: usize) {
        let free = self.free_key();
        self.keys = vec![free; capacity];
        self.values = self.value.map(|d| vec![empty_value(d); capacity]);
        self.live = 0;
        self.tombstones = 0;
    }

    pub fn key_domain(&self) -> Domain {
        self.key
    }

    pub fn value_domain(&self) -> Option<Domain> {
        self.value
    }

    pub fn key_strategy(&self) -> &'static dyn DomainStrategy {
        self.key.strategy()
    }

    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Entries, the null key included.
    pub fn len(&self) -> usize {
        self.live + usize::from(self.null_value.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Presented result of a miss.
    pub fn default_value(&self) -> Datum {
        self.default_value.clone()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    pub fn sentinels(&self) -> Option<&SentinelState> {
        self.markers.as_ref().map(SentinelAllocator::state)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            scans: self.counters.scans.get(),
            rehashes: self.counters.rehashes.get(),
            rebindings: self.sentinels().map_or(0, SentinelState::rebindings),
        }
    }

    fn free_key(&self) -> Datum {
        match &self.markers {
            Some(m) => Datum::Bits(m.current_free()),
            None => Datum::null(),
        }
    }

    fn removed_key(&self) -> Option<Datum> {
        match (&self.markers, &self.removed_ref) {
            (Some(m), _) => m.current_removed().map(Datum::Bits),
            (None, Some(r)) => Some(Datum::Ref(Some(Rc::clone(r)))),
            (None, None) => None,
        }
    }

    /// Whether a stored numeric key currently equals a marker.
    pub fn is_marker(&self, key: &Datum) -> bool {
        match (&self.markers, key) {
            (Some(m), Datum::Bits(b)) => m.is_marker(*b),
            _ => false,
        }
    }

    fn classify(&self, index: usize, key: &Datum) -> SlotClass {
        match (&self.keys[index], &self.markers) {
            (Datum::Bits(b), Some(m)) => {
                if *b == m.current_free() {
                    SlotClass::Free
                } else if Some(*b) == m.current_removed() {
                    SlotClass::Tombstone
                } else if Some(*b) == key.bits() {
                    SlotClass::Match
                } else {
                    SlotClass::Occupied
                }
            }
            (Datum::Ref(None), _) => SlotClass::Free,
            (Datum::Ref(Some(r)), _)
                if self.removed_ref.as_ref().is_some_and(|t| Rc::ptr_eq(r, t)) =>
            {
                SlotClass::Tombstone
            }
            (slot, _) if self.key.strategy().equals(slot, key) => SlotClass::Match,
            _ => SlotClass::Occupied,
        }
    }

    fn hash(&self, key: &Datum) -> u64 {
        self.hasher.hash_one(StoredKey(key))
    }

    /// Tombstone-aware scan for a stored, non-null key.
    pub fn scan(&self, key: &Datum) -> Result<ScanOutcome, ProbeError> {
        self.counters.scans.set(self.counters.scans.get() + 1);
        self.probe
            .scan(self.hash(key), self.capacity(), |i| self.classify(i, key))
    }

    /// Slot currently holding `key`, if any.
    pub fn slot_of(&self, key: &Datum) -> Option<SlotIndex> {
        if key.is_null() {
            return self.null_value.as_ref().map(|_| SlotIndex::Null);
        }
        if self.is_marker(key) {
            return None;
        }
        match self.scan(key) {
            Ok(ScanOutcome::Present { index }) => Some(SlotIndex::Table(index)),
            _ => None,
        }
    }

    pub fn null_occupied(&self) -> bool {
        self.null_value.is_some()
    }

    /// Stored value at `slot`.
    pub fn value_at(&self, slot: SlotIndex) -> Result<Datum, StoreError> {
        match slot {
            SlotIndex::Null => self.null_value.clone().ok_or(StoreError::NoValues),
            SlotIndex::Table(i) => self
                .values
                .as_ref()
                .map(|v| v[i].clone())
                .ok_or(StoreError::NoValues),
        }
    }

    pub fn set_value(&mut self, slot: SlotIndex, value: Datum) -> Result<(), StoreError> {
        match slot {
            SlotIndex::Null => self.null_value = Some(value),
            SlotIndex::Table(i) => {
                let values = self.values.as_mut().ok_or(StoreError::NoValues)?;
                values[i] = value;
            }
        }
        Ok(())
    }

    /// Stores `key` at `slot`, which must be free, a tombstone or the null
    /// slot. May grow or clean the array afterwards, invalidating indices.
    pub fn insert_at(
        &mut self,
        slot: SlotIndex,
        key: Datum,
        value: Option<Datum>,
    ) -> Result<(), StoreError> {
        match slot {
            SlotIndex::Null => {
                // Sets keep a placeholder so the slot reads as occupied.
                self.null_value = Some(value.unwrap_or(Datum::Bool(true)));
                return Ok(());
            }
            SlotIndex::Table(i) => {
                if self.classify(i, &key) == SlotClass::Tombstone {
                    self.tombstones -= 1;
                }
                self.keys[i] = key;
                if let (Some(values), Some(v)) = (self.values.as_mut(), value) {
                    values[i] = v;
                }
                self.live += 1;
            }
        }
        self.maybe_rehash()
    }

    /// Tombstones `slot`. `clear_value` drops the stored value.
    pub fn remove_at(&mut self, slot: SlotIndex, clear_value: bool) -> Result<(), StoreError> {
        match slot {
            SlotIndex::Null => self.null_value = None,
            SlotIndex::Table(i) => {
                let removed = self.removed_key().ok_or(StoreError::RemovalUnsupported)?;
                self.keys[i] = removed;
                if clear_value {
                    if let (Some(values), Some(d)) = (self.values.as_mut(), self.value) {
                        values[i] = empty_value(d);
                    }
                }
                self.live -= 1;
                self.tombstones += 1;
            }
        }
        Ok(())
    }

    /// Moves a marker out of the way of `key`, which is about to be stored,
    /// and rewrites every slot holding the old marker.
    pub fn rebind_for(&mut self, key: &Datum) -> Result<Option<Rebinding>, StoreError> {
        let Some(bits) = key.bits() else {
            return Ok(None);
        };
        let Some(markers) = self.markers.as_mut() else {
            return Ok(None);
        };
        if !markers.is_marker(bits) {
            return Ok(None);
        }
        let mut in_use: HashSet<u64> = self
            .keys
            .iter()
            .filter_map(Datum::bits)
            .filter(|b| !markers.is_marker(*b))
            .collect();
        in_use.insert(bits);
        let Some(r) = markers.on_key_equals(bits, &in_use)? else {
            return Ok(None);
        };
        for k in self.keys.iter_mut() {
            if *k == Datum::Bits(r.old) {
                *k = Datum::Bits(r.new);
            }
        }
        Ok(Some(r))
    }

    fn maybe_rehash(&mut self) -> Result<(), StoreError> {
        let used = self.live + self.tombstones;
        let cap = self.capacity();
        if (used as f64) < cap as f64 * self.max_load && used + 1 < cap {
            return Ok(());
        }
        let mut new_cap = cap;
        while self.live as f64 * 2.0 > new_cap as f64 * self.max_load {
            new_cap *= 2;
        }
        self.rehash(new_cap)
    }

    /// Rebuilds the array at `capacity`, dropping tombstones.
    fn rehash(&mut self, capacity: usize) -> Result<(), StoreError> {
        let old_keys = core::mem::take(&mut self.keys);
        let old_values = self.values.take();
        let entries: Vec<(Datum, Option<Datum>)> = old_keys
            .into_iter()
            .enumerate()
            .filter(|(_, k)| self.is_live_key(k))
            .map(|(i, k)| (k, old_values.as_ref().map(|v| v[i].clone())))
            .collect();
        let dropped = self.tombstones;
        self.reset(capacity);
        for (k, v) in entries {
            let slot = self
                .scan(&k)?
                .insertion_slot()
                .ok_or(ProbeError::Exhausted { capacity })?;
            self.keys[slot] = k;
            if let (Some(values), Some(v)) = (self.values.as_mut(), v) {
                values[slot] = v;
            }
            self.live += 1;
        }
        self.counters.rehashes.set(self.counters.rehashes.get() + 1);
        tracing::debug!(capacity, live = self.live, tombstones = dropped, "slot array rehashed");
        Ok(())
    }

    fn is_live_key(&self, key: &Datum) -> bool {
        match (key, &self.markers) {
            (Datum::Bits(b), Some(m)) => !m.is_marker(*b),
            (Datum::Ref(None), _) => false,
            (Datum::Ref(Some(r)), _) => {
                !self.removed_ref.as_ref().is_some_and(|t| Rc::ptr_eq(r, t))
            }
            _ => true,
        }
    }

    /// Live entries in stored form; the null key comes first.
    pub fn entries(&self) -> Vec<(Datum, Option<Datum>)> {
        let mut out = Vec::with_capacity(self.len());
        if let Some(v) = &self.null_value {
            out.push((Datum::null(), self.value.map(|_| v.clone())));
        }
        for (i, k) in self.keys.iter().enumerate() {
            if self.is_live_key(k) {
                out.push((k.clone(), self.values.as_ref().map(|v| v[i].clone())));
            }
        }
        out
    }
}

/// Content of a value slot nobody wrote.
fn empty_value(domain: Domain) -> Datum {
    match domain {
        Domain::Reference { .. } => Datum::null(),
        _ => Datum::Bits(0),
    }
}

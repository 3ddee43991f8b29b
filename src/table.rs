//! `SentinelTable`: an open-addressing table whose operations run
//! specialized plans.
//!
//! Construction specializes every operation kind once for the table's
//! shape, along with the query-update operations built from their own
//! bodies. Operations the shape cannot support are left out, and the union
//! of the remaining plans' permissions is the table's operation surface.

use crate::access::ExclusiveAccess;
use crate::analyzer::BodySource;
use crate::bodies::{ContainsEntryBody, JustPutBody, MembershipBody};
use crate::domain::Datum;
use crate::exec::{execute, ExecError};
use crate::ir::{Branch, OperationKind, PermissionSet};
use crate::probe::ProbeStrategy;
use crate::sentinel::SentinelState;
use crate::specializer::{
    Mutability, OperationDescriptor, OperationSpecializer, SpecializeError, SpecializedOp,
    SpecializerConfig, TableShape,
};
use crate::store::{SlotIndex, SlotStore, StoreLayout, StoreStats};
use core::hash::BuildHasher;
use hashbrown::HashMap;
use std::collections::hash_map::RandomState;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct TableConfig {
    /// Rounded up to a power of two, at least 4.
    pub initial_capacity: usize,
    /// Clamped into `[0.1, 0.9]`.
    pub max_load: f64,
    pub probe: ProbeStrategy,
    /// Expand the probe loop into the plans.
    pub inline: bool,
    pub most_probable: Branch,
    /// Returned by misses instead of the value domain's default.
    pub default_value: Option<Datum>,
    pub specializer: SpecializerConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            max_load: 0.75,
            probe: ProbeStrategy::DoubleHash,
            inline: true,
            most_probable: Branch::Present,
            default_value: None,
            specializer: SpecializerConfig::default(),
        }
    }
}

impl TableConfig {
    pub fn with_default_value(mut self, value: Datum) -> Self {
        self.default_value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error("{0:?} is not part of this table's operation surface")]
    Unsupported(OperationKind),
    #[error("operation needs a {0}")]
    ShapeMismatch(&'static str),
    #[error(transparent)]
    Specialize(#[from] SpecializeError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Counters exposed for tests and benches.
pub type TableStats = StoreStats;

/// Operations that run a built-in probe kind with their own bodies.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueryOp {
    ContainsKey,
    ContainsEntry,
    JustPut,
}

impl QueryOp {
    pub const ALL: [QueryOp; 3] = [QueryOp::ContainsKey, QueryOp::ContainsEntry, QueryOp::JustPut];

    /// Probe kind the bodies are specialized under.
    pub fn kind(self) -> OperationKind {
        match self {
            QueryOp::ContainsKey | QueryOp::ContainsEntry => OperationKind::Lookup,
            QueryOp::JustPut => OperationKind::Insert,
        }
    }

    fn body(self) -> &'static dyn BodySource {
        match self {
            QueryOp::ContainsKey => &MembershipBody,
            QueryOp::ContainsEntry => &ContainsEntryBody,
            QueryOp::JustPut => &JustPutBody,
        }
    }
}

/// Plans of every operation a shape supports.
struct Surface {
    ops: HashMap<OperationKind, SpecializedOp>,
    queries: HashMap<QueryOp, SpecializedOp>,
    permissions: PermissionSet,
}

pub struct SentinelTable<S = RandomState> {
    shape: TableShape,
    store: SlotStore<S>,
    surface: Surface,
    access: ExclusiveAccess,
}

impl SentinelTable<RandomState> {
    pub fn new(shape: TableShape) -> Result<Self, TableError> {
        Self::with_config(shape, TableConfig::default())
    }

    pub fn with_config(shape: TableShape, config: TableConfig) -> Result<Self, TableError> {
        Self::with_hasher(shape, config, RandomState::new())
    }

    /// Builds an immutable table holding `entries` (presented key, and value
    /// for maps). Later duplicates overwrite earlier ones.
    pub fn from_entries<I>(
        shape: TableShape,
        config: TableConfig,
        entries: I,
    ) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = (Datum, Option<Datum>)>,
    {
        let loading = TableShape {
            mutability: Mutability::Updatable,
            ..shape
        };
        let mut table = Self::with_config(loading, config.clone())?;
        for (k, v) in entries {
            match (v, shape.is_map()) {
                (Some(v), true) => {
                    table.insert(k, v)?;
                }
                (None, false) => {
                    table.add(k)?;
                }
                (_, true) => return Err(TableError::ShapeMismatch("value for every map entry")),
                (_, false) => return Err(TableError::ShapeMismatch("map to store values")),
            }
        }
        table.freeze(shape, &config)?;
        Ok(table)
    }
}

impl<S: BuildHasher> SentinelTable<S> {
    pub fn with_hasher(
        shape: TableShape,
        config: TableConfig,
        hasher: S,
    ) -> Result<Self, TableError> {
        let surface = specialize_surface(shape, &config)?;
        let store = SlotStore::new(
            StoreLayout {
                key: shape.key,
                value: shape.value,
                removable: shape.mutability.has_tombstones(),
                capacity: config.initial_capacity,
                max_load: config.max_load.clamp(0.1, 0.9),
                probe: config.probe,
                default_value: config.default_value,
            },
            hasher,
        );
        tracing::debug!(
            key = %shape.key,
            value = ?shape.value,
            mutability = ?shape.mutability,
            operations = surface.ops.len() + surface.queries.len(),
            "sentinel table created"
        );
        Ok(Self {
            shape,
            store,
            surface,
            access: ExclusiveAccess::new(),
        })
    }

    /// Drops the operations `shape` does not support.
    fn freeze(&mut self, shape: TableShape, config: &TableConfig) -> Result<(), TableError> {
        self.surface = specialize_surface(shape, config)?;
        self.shape = shape;
        Ok(())
    }

    pub fn shape(&self) -> TableShape {
        self.shape
    }

    /// Capabilities of this table's operations.
    pub fn permissions(&self) -> &PermissionSet {
        &self.surface.permissions
    }

    pub fn supports(&self, kind: OperationKind) -> bool {
        self.surface.ops.contains_key(&kind)
    }

    /// Plan serving `kind`, if it is on the surface.
    pub fn plan(&self, kind: OperationKind) -> Option<&SpecializedOp> {
        self.surface.ops.get(&kind)
    }

    pub fn query_plan(&self, query: QueryOp) -> Option<&SpecializedOp> {
        self.surface.queries.get(&query)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Current markers; `None` for reference keys.
    pub fn sentinels(&self) -> Option<&SentinelState> {
        self.store.sentinels()
    }

    pub fn stats(&self) -> TableStats {
        self.store.stats()
    }

    /// Slot holding `key`: `Some(SlotIndex::Null)` for a stored null key.
    pub fn slot_of(&self, key: &Datum) -> Result<Option<SlotIndex>, TableError> {
        let _g = self.access.enter(OperationKind::Lookup);
        if key.is_null() {
            return Ok(self.store.slot_of(key));
        }
        let strategy = self.shape.key.strategy();
        let stored = strategy.normalize(strategy.unwrap(key).map_err(ExecError::from)?);
        Ok(self.store.slot_of(&stored))
    }

    /// Value for `key`, or the default value when absent. Key sets answer
    /// membership.
    pub fn get(&self, key: &Datum) -> Result<Datum, TableError> {
        let _g = self.access.enter(OperationKind::Lookup);
        let op = self.op(OperationKind::Lookup)?;
        Ok(execute(&op.plan, &self.store, key, None)?)
    }

    pub fn contains_key(&self, key: &Datum) -> Result<bool, TableError> {
        let _g = self.access.enter(OperationKind::Lookup);
        let op = self.query(QueryOp::ContainsKey)?;
        Ok(execute(&op.plan, &self.store, key, None)? == Datum::Bool(true))
    }

    /// Whether `key` is present and maps to `value`.
    pub fn contains_entry(&self, key: &Datum, value: &Datum) -> Result<bool, TableError> {
        self.require_map()?;
        let _g = self.access.enter(OperationKind::Lookup);
        let op = self.query(QueryOp::ContainsEntry)?;
        Ok(execute(&op.plan, &self.store, key, Some(value))? == Datum::Bool(true))
    }

    /// Stores `value` under `key`; returns the previous value or the default.
    pub fn insert(&mut self, key: Datum, value: Datum) -> Result<Datum, TableError> {
        self.require_map()?;
        self.run_mut(OperationKind::Insert, &key, Some(&value))
    }

    /// Adds `key` to a key set; `true` if it was not there.
    pub fn add(&mut self, key: Datum) -> Result<bool, TableError> {
        self.require_set()?;
        Ok(self.run_mut(OperationKind::Insert, &key, None)? == Datum::Bool(true))
    }

    /// Stores `value` under `key` without reading the previous value.
    pub fn just_put(&mut self, key: Datum, value: Datum) -> Result<(), TableError> {
        self.require_map()?;
        self.run_query(QueryOp::JustPut, &key, Some(&value))
    }

    /// Adds `key` to a key set without reporting whether it was there.
    pub fn just_add(&mut self, key: Datum) -> Result<(), TableError> {
        self.require_set()?;
        self.run_query(QueryOp::JustPut, &key, None)
    }

    /// Stores `value` only if `key` is absent. Returns the value already
    /// stored, or the default when the insert happened.
    pub fn put_if_absent(&mut self, key: Datum, value: Datum) -> Result<Datum, TableError> {
        self.require_map()?;
        self.run_mut(OperationKind::CustomInsert, &key, Some(&value))
    }

    /// Removes `key`. Maps return the removed value or the default; key sets
    /// return whether the key was there.
    pub fn remove(&mut self, key: &Datum) -> Result<Datum, TableError> {
        self.run_mut(OperationKind::Remove, key, None)
    }

    /// Replaces the value of a present key; returns the previous value, or
    /// the default without inserting when absent.
    pub fn replace(&mut self, key: Datum, value: Datum) -> Result<Datum, TableError> {
        self.run_mut(OperationKind::ReplaceValue, &key, Some(&value))
    }

    /// Entries in presented form, in slot order; a null key comes first.
    pub fn iter(&self) -> Result<Vec<(Datum, Option<Datum>)>, TableError> {
        let key = self.shape.key.strategy();
        let value = self.shape.value.map(|d| d.strategy());
        self.store
            .entries()
            .into_iter()
            .map(|(k, v)| {
                let k = key.wrap(&k).map_err(ExecError::from)?;
                let v = match (v, value) {
                    (Some(v), Some(s)) => Some(s.wrap(&v).map_err(ExecError::from)?),
                    _ => None,
                };
                Ok((k, v))
            })
            .collect()
    }

    fn op(&self, kind: OperationKind) -> Result<&SpecializedOp, TableError> {
        self.surface.ops.get(&kind).ok_or(TableError::Unsupported(kind))
    }

    fn query(&self, query: QueryOp) -> Result<&SpecializedOp, TableError> {
        self.surface
            .queries
            .get(&query)
            .ok_or(TableError::Unsupported(query.kind()))
    }

    fn run_mut(
        &mut self,
        kind: OperationKind,
        key: &Datum,
        value: Option<&Datum>,
    ) -> Result<Datum, TableError> {
        let _g = self.access.enter(kind);
        let op = self.surface.ops.get(&kind).ok_or(TableError::Unsupported(kind))?;
        Ok(execute(&op.plan, &mut self.store, key, value)?)
    }

    fn run_query(
        &mut self,
        query: QueryOp,
        key: &Datum,
        value: Option<&Datum>,
    ) -> Result<(), TableError> {
        let _g = self.access.enter(query.kind());
        let op = self
            .surface
            .queries
            .get(&query)
            .ok_or(TableError::Unsupported(query.kind()))?;
        execute(&op.plan, &mut self.store, key, value)?;
        Ok(())
    }

    fn require_map(&self) -> Result<(), TableError> {
        if self.shape.is_map() {
            Ok(())
        } else {
            Err(TableError::ShapeMismatch("map"))
        }
    }

    fn require_set(&self) -> Result<(), TableError> {
        if self.shape.is_map() {
            Err(TableError::ShapeMismatch("key set"))
        } else {
            Ok(())
        }
    }
}

fn descriptor(kind: OperationKind, config: &TableConfig) -> OperationDescriptor {
    OperationDescriptor::new(kind)
        .inline(config.inline)
        .most_probable(config.most_probable)
}

/// Specializes every operation `shape` supports.
fn specialize_surface(shape: TableShape, config: &TableConfig) -> Result<Surface, TableError> {
    let specializer = OperationSpecializer::with_config(config.specializer.clone());
    let mut ops = HashMap::new();
    let mut queries = HashMap::new();
    let mut permissions = PermissionSet::new();
    for kind in OperationKind::ALL {
        match specializer.specialize(descriptor(kind, config), shape) {
            Ok(op) => {
                permissions.extend(&op.permissions);
                ops.insert(kind, op);
            }
            Err(SpecializeError::Unsupported { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    for query in QueryOp::ALL {
        if query == QueryOp::ContainsEntry && !shape.is_map() {
            continue;
        }
        let desc = descriptor(query.kind(), config);
        match specializer.specialize_with(desc, shape, query.body()) {
            Ok(op) => {
                permissions.extend(&op.permissions);
                queries.insert(query, op);
            }
            // An out-of-line key-set put is the insert primitive alone.
            Err(SpecializeError::BothBranchesEmpty { .. }) => {
                if let Some(op) = ops.get(&query.kind()) {
                    queries.insert(query, op.clone());
                }
            }
            Err(SpecializeError::Unsupported { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Surface {
        ops,
        queries,
        permissions,
    })
}

//! Statement-tree IR for specialized table operations.
//!
//! Plans are compared and rewritten structurally: two statements are the
//! same statement iff they are `==`. Hoisting and materialization in the
//! specializer operate on these trees directly.
//!
//! Plan shape:
//! - `key_steps`: key handling that runs before anything else (null check,
//!   float normalization, marker validation or rebinding);
//! - `lifted`: statements executed unconditionally before the branch decision;
//! - `decision`: the single point where control splits into present/absent;
//! - `present` / `absent`: the two mutually exclusive segments;
//! - `blocks`: labels of segments extracted behind a jump target.

use hashbrown::HashSet;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Label of a segment extracted out of line and reached by jumps.
    pub struct BlockId;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OperationKind {
    Lookup,
    Insert,
    CustomInsert,
    Remove,
    ReplaceValue,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Lookup,
        OperationKind::Insert,
        OperationKind::CustomInsert,
        OperationKind::Remove,
        OperationKind::ReplaceValue,
    ];

    /// Operations that may store a new key.
    pub fn inserts(self) -> bool {
        matches!(self, OperationKind::Insert | OperationKind::CustomInsert)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Branch {
    Present,
    Absent,
}

impl Branch {
    pub fn other(self) -> Branch {
        match self {
            Branch::Present => Branch::Absent,
            Branch::Absent => Branch::Present,
        }
    }
}

/// Plan-local variables.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Local {
    /// Slot index of the key (present) or of its insertion point (absent).
    Index,
    /// Result of the insertion-index primitive.
    Insertion,
    /// Captured reference to the backing value array.
    Values,
    /// Captured current value at `Index`.
    Value,
    /// Previous value returned by replacing operations.
    Prev,
    Temp(u8),
}

/// Access path to the backing value array.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArrayRef {
    /// Direct read of the table's array field.
    Field,
    /// The `Values` local.
    Local,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Expr {
    /// Stored form of the probed key.
    Key,
    /// Stored form of the value argument.
    ValueArg,
    Local(Local),
    /// The backing value array itself.
    Array(ArrayRef),
    /// `values[index]`.
    CurrentValue(ArrayRef),
    /// Slot carried by the insertion-index primitive.
    InsertionSlot,
    /// Stored value to presented value.
    Wrap(Box<Expr>),
    /// Whether a stored value equals the value argument.
    ValueEquals(Box<Expr>),
    /// The table's default value, presented.
    Default,
    Bool(bool),
    Const(i64),
}

impl Expr {
    pub fn wrap(e: Expr) -> Expr {
        Expr::Wrap(Box::new(e))
    }

    pub fn value_equals(e: Expr) -> Expr {
        Expr::ValueEquals(Box::new(e))
    }

    fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        if let Expr::Wrap(inner) | Expr::ValueEquals(inner) = self {
            inner.walk(f);
        }
    }

    fn walk_mut(&mut self, f: &mut impl FnMut(&mut Expr)) {
        f(self);
        if let Expr::Wrap(inner) | Expr::ValueEquals(inner) = self {
            inner.walk_mut(f);
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Stmt {
    Let(Local, Expr),
    /// `values[index] = value`
    StoreValue { array: ArrayRef, value: Expr },
    /// `keys[index] = key` (and the value, for maps), then the post-insert hook.
    InsertAt {
        key: Expr,
        value: Option<(ArrayRef, Expr)>,
    },
    /// `keys[index] = removed`, clearing the value for reference values.
    RemoveAt { clear_value: Option<ArrayRef> },
    Return(Expr),
}

impl Stmt {
    /// Visits every expression and array path of the statement.
    fn walk(&self, f: &mut impl FnMut(&Expr), arrays: &mut impl FnMut(ArrayRef)) {
        match self {
            Stmt::Let(_, e) | Stmt::Return(e) => e.walk(f),
            Stmt::StoreValue { array, value } => {
                arrays(*array);
                value.walk(f);
            }
            Stmt::InsertAt { key, value } => {
                key.walk(f);
                if let Some((array, v)) = value {
                    arrays(*array);
                    v.walk(f);
                }
            }
            Stmt::RemoveAt { clear_value } => {
                if let Some(array) = clear_value {
                    arrays(*array);
                }
            }
        }
    }

    fn walk_mut(
        &mut self,
        f: &mut impl FnMut(&mut Expr),
        arrays: &mut impl FnMut(&mut ArrayRef),
    ) {
        match self {
            Stmt::Let(_, e) | Stmt::Return(e) => e.walk_mut(f),
            Stmt::StoreValue { array, value } => {
                arrays(array);
                value.walk_mut(f);
            }
            Stmt::InsertAt { key, value } => {
                key.walk_mut(f);
                if let Some((array, v)) = value {
                    arrays(array);
                    v.walk_mut(f);
                }
            }
            Stmt::RemoveAt { clear_value } => {
                if let Some(array) = clear_value {
                    arrays(array);
                }
            }
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Stmt::Return(_))
    }

    pub fn writes_storage(&self) -> bool {
        matches!(
            self,
            Stmt::StoreValue { .. } | Stmt::InsertAt { .. } | Stmt::RemoveAt { .. }
        )
    }

    /// Whether the statement needs the slot located by the probe.
    pub fn depends_on_probe(&self) -> bool {
        if self.writes_storage() {
            return true;
        }
        let mut depends = false;
        self.walk(
            &mut |e| {
                depends |= matches!(
                    e,
                    Expr::CurrentValue(_)
                        | Expr::InsertionSlot
                        | Expr::Local(Local::Index)
                        | Expr::Local(Local::Insertion)
                        | Expr::Local(Local::Value)
                );
            },
            &mut |_| {},
        );
        depends
    }

    pub fn permission(&self) -> Option<Permission> {
        match self {
            Stmt::StoreValue { .. } => Some(Permission::SetValue),
            Stmt::InsertAt { .. } => Some(Permission::Insert),
            Stmt::RemoveAt { .. } => Some(Permission::Remove),
            Stmt::Let(..) | Stmt::Return(_) => None,
        }
    }
}

/// Direct storage references within a run of statements.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StorageRefs {
    /// `values[index]` reads.
    pub value_reads: usize,
    /// Uses of the array field, including those inside value reads.
    pub array_refs: usize,
}

impl StorageRefs {
    pub fn of(stmts: &[Stmt]) -> Self {
        let mut refs = StorageRefs::default();
        for s in stmts {
            let mut field_arrays = 0;
            s.walk(
                &mut |e| match e {
                    Expr::CurrentValue(a) => {
                        refs.value_reads += 1;
                        if *a == ArrayRef::Field {
                            refs.array_refs += 1;
                        }
                    }
                    Expr::Array(ArrayRef::Field) => refs.array_refs += 1,
                    _ => {}
                },
                &mut |a| {
                    if a == ArrayRef::Field {
                        field_arrays += 1;
                    }
                },
            );
            refs.array_refs += field_arrays;
        }
        refs
    }
}

/// Replaces every `values[index]` read with the `Value` local.
pub fn rewrite_value_reads(stmts: &mut [Stmt]) {
    for s in stmts {
        s.walk_mut(
            &mut |e| {
                if matches!(e, Expr::CurrentValue(_)) {
                    *e = Expr::Local(Local::Value);
                }
            },
            &mut |_| {},
        );
    }
}

/// Routes every use of the array field through the `Values` local.
pub fn rewrite_array_refs(stmts: &mut [Stmt]) {
    for s in stmts {
        s.walk_mut(
            &mut |e| match e {
                Expr::CurrentValue(a) | Expr::Array(a) => *a = ArrayRef::Local,
                _ => {}
            },
            &mut |a| *a = ArrayRef::Local,
        );
    }
}

/// Index of the first value read that follows a storage write, if any.
pub fn read_after_write(stmts: &[Stmt]) -> Option<usize> {
    let mut written = false;
    for (i, s) in stmts.iter().enumerate() {
        if written && StorageRefs::of(core::slice::from_ref(s)).value_reads > 0 {
            return Some(i);
        }
        written |= s.writes_storage();
    }
    None
}

/// Primitive used to locate the key when the scan is not expanded inline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProbeCall {
    /// `index(key)`: slot of the key or absent.
    Index,
    /// `insert(key, value)`: inserts when absent, else returns the slot.
    Insert,
    /// `insertionIndex(key)`: existing slot or insertion point, no mutation.
    InsertionIndex,
}

/// How a jump site of an inline scan reaches a segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Exit {
    /// The segment is emitted at every jump site.
    Inline,
    Jump(BlockId),
    /// The segment is empty; control leaves the operation.
    Fallthrough,
}

/// Inline expansion of the probe loop.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ScanPlan {
    /// Test performed first on each visited slot.
    pub first_check: Branch,
    pub skip_tombstones: bool,
    /// Inserting scans remember the first tombstone as insertion point.
    pub track_first_tombstone: bool,
    pub present: Exit,
    pub absent: Exit,
}

impl ScanPlan {
    pub fn exit(&self, branch: Branch) -> Exit {
        match branch {
            Branch::Present => self.present,
            Branch::Absent => self.absent,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Decision {
    /// `if probe.present() { primary } else { other }`
    Split { probe: ProbeCall, primary: Branch },
    /// Only `branch` has statements; it runs when its test holds.
    Guard { probe: ProbeCall, branch: Branch },
    Scan(ScanPlan),
}

/// Handling of a null reference key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NullPath {
    /// The key lives in the table's dedicated null slot.
    DedicatedSlot,
    /// Null cannot be stored, so the absent segment answers.
    Absent,
    Reject,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyStep {
    NullCheck(NullPath),
    NormalizeFloat,
    /// A key equal to a marker cannot be stored: answer from the absent segment.
    CheckMarkers,
    /// Move a marker out of the way of the key about to be stored.
    RebindMarkers,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub branch: Branch,
    pub stmts: Vec<Stmt>,
    pub label: Option<BlockId>,
}

impl Segment {
    pub fn new(branch: Branch, stmts: Vec<Stmt>) -> Self {
        Self {
            branch,
            stmts,
            label: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct BranchPlan {
    pub key_steps: Vec<KeyStep>,
    pub lifted: Vec<Stmt>,
    pub decision: Decision,
    pub present: Segment,
    pub absent: Segment,
    pub blocks: SlotMap<BlockId, Branch>,
}

impl BranchPlan {
    pub fn segment(&self, branch: Branch) -> &Segment {
        match branch {
            Branch::Present => &self.present,
            Branch::Absent => &self.absent,
        }
    }

    /// Points where control splits between present and absent.
    pub fn decision_points(&self) -> usize {
        match &self.decision {
            Decision::Split { .. } => 1,
            Decision::Guard { .. } => 0,
            Decision::Scan(_) => usize::from(!self.present.is_empty() && !self.absent.is_empty()),
        }
    }

    /// Resolves a jump target.
    pub fn block(&self, id: BlockId) -> Option<&Segment> {
        self.blocks.get(id).map(|b| self.segment(*b))
    }

    pub fn count_key_steps(&self, step: KeyStep) -> usize {
        self.key_steps.iter().filter(|s| **s == step).count()
    }
}

impl PartialEq for BranchPlan {
    fn eq(&self, other: &Self) -> bool {
        self.key_steps == other.key_steps
            && self.lifted == other.lifted
            && self.decision == other.decision
            && self.present == other.present
            && self.absent == other.absent
            && self.blocks.iter().eq(other.blocks.iter())
    }
}

impl Eq for BranchPlan {}

/// Capability a plan needs from the surrounding table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Permission {
    Insert,
    Remove,
    SetValue,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PermissionSet(HashSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(perms: &[Permission]) -> Self {
        Self(perms.iter().copied().collect())
    }

    pub fn insert(&mut self, p: Permission) {
        self.0.insert(p);
    }

    pub fn contains(&self, p: Permission) -> bool {
        self.0.contains(&p)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_subset(&self, other: &PermissionSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn extend(&mut self, other: &PermissionSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }
}

//! OperationSpecializer: turns (operation, table shape) into a [`BranchPlan`].
//!
//! Stages, in order: `Start → Measured → LayoutChosen → Hoisted →
//! Materialized → Finalized`. Every stage reads and extends one
//! [`SpecContext`]; any violated assumption aborts the whole call.

use crate::analyzer::{
    synthesize, BodyContext, BodySource, BranchCostAnalyzer, BranchMetrics, Measurements,
};
use crate::bodies::BuiltinBody;
use crate::domain::Domain;
use crate::ir::{
    read_after_write, rewrite_array_refs, rewrite_value_reads, ArrayRef, BlockId, Branch,
    BranchPlan, Decision, Exit, Expr, KeyStep, Local, NullPath, OperationKind, Permission,
    PermissionSet, ProbeCall, ScanPlan, Segment, Stmt, StorageRefs,
};
use slotmap::SlotMap;
use thiserror::Error;

/// Captures that can head both bodies: the value array, the current value
/// and the insertion index. One hoisting round per kind.
const HOISTABLE_CAPTURES: usize = 3;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpecializerConfig {
    /// Inline scans extract a branch with more statements than this behind a
    /// label.
    pub extract_threshold: usize,
    /// A storage read used this many times in a segment is captured.
    pub capture_threshold: usize,
    pub hoist_rounds: usize,
}

impl Default for SpecializerConfig {
    fn default() -> Self {
        Self {
            extract_threshold: 1,
            capture_threshold: 2,
            hoist_rounds: HOISTABLE_CAPTURES,
        }
    }
}

/// How far a table may be changed after construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Mutability {
    /// Built once from entries, read-only afterwards.
    Immutable,
    /// Keys can be added and values replaced, never removed.
    Updatable,
    /// Full surface; the only level with tombstones.
    Mutable,
}

impl Mutability {
    /// Capabilities a table of this level may expose.
    pub fn permissions(self) -> PermissionSet {
        match self {
            Mutability::Immutable => PermissionSet::new(),
            Mutability::Updatable => PermissionSet::of(&[Permission::Insert, Permission::SetValue]),
            Mutability::Mutable => PermissionSet::of(&[
                Permission::Insert,
                Permission::Remove,
                Permission::SetValue,
            ]),
        }
    }

    pub fn has_tombstones(self) -> bool {
        self == Mutability::Mutable
    }
}

/// Key domain, value domain (none for bare key sets) and mutability.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TableShape {
    pub key: Domain,
    pub value: Option<Domain>,
    pub mutability: Mutability,
}

impl TableShape {
    pub fn map(key: Domain, value: Domain, mutability: Mutability) -> Self {
        Self {
            key,
            value: Some(value),
            mutability,
        }
    }

    pub fn set(key: Domain, mutability: Mutability) -> Self {
        Self {
            key,
            value: None,
            mutability,
        }
    }

    pub fn is_map(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    pub most_probable: Branch,
    pub inline: bool,
}

impl OperationDescriptor {
    /// Out-of-line probe, present branch expected.
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            most_probable: Branch::Present,
            inline: false,
        }
    }

    pub fn most_probable(mut self, branch: Branch) -> Self {
        self.most_probable = branch;
        self
    }

    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }
}

/// Final plan and the capabilities it needs from the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecializedOp {
    pub descriptor: OperationDescriptor,
    pub plan: BranchPlan,
    pub permissions: PermissionSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecializeError {
    #[error("{kind:?}: present and absent bodies are both empty")]
    BothBranchesEmpty { kind: OperationKind },
    #[error(
        "{branch:?} body changed between measurement ({measured:?}) and synthesis ({actual:?})"
    )]
    UsageMismatch {
        branch: Branch,
        measured: BranchMetrics,
        actual: BranchMetrics,
    },
    #[error("{branch:?} body reads the stored value at statement {index} after writing it")]
    StaleCapture { branch: Branch, index: usize },
    #[error("{kind:?} is not supported here: {reason}")]
    Unsupported {
        kind: OperationKind,
        reason: &'static str,
    },
}

/// Stages only move forward.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Stage {
    Start,
    Measured,
    LayoutChosen,
    Hoisted,
    Materialized,
    Finalized,
}

/// Layout fixed from the measurements.
#[derive(Clone, Debug)]
struct Layout {
    decision: Decision,
    blocks: SlotMap<BlockId, Branch>,
    present_label: Option<BlockId>,
    absent_label: Option<BlockId>,
    share_array: bool,
}

/// State threaded explicitly through the stages of one call.
pub struct SpecContext<'a> {
    pub descriptor: OperationDescriptor,
    pub shape: TableShape,
    pub body: BodyContext,
    pub config: &'a SpecializerConfig,
    stage: Stage,
}

impl<'a> SpecContext<'a> {
    fn new(
        descriptor: OperationDescriptor,
        shape: TableShape,
        config: &'a SpecializerConfig,
    ) -> Self {
        Self {
            descriptor,
            shape,
            body: BodyContext {
                kind: descriptor.kind,
                key: shape.key,
                value: shape.value,
                inline: descriptor.inline,
            },
            config,
            stage: Stage::Start,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage {:?} after {:?}", next, self.stage);
        tracing::trace!(
            kind = ?self.descriptor.kind,
            from = ?self.stage,
            to = ?next,
            "specializer stage"
        );
        self.stage = next;
    }

    /// Primitive that locates the key when the scan is not inline.
    pub fn probe_call(&self) -> ProbeCall {
        match self.descriptor.kind {
            OperationKind::Lookup | OperationKind::Remove | OperationKind::ReplaceValue => {
                ProbeCall::Index
            }
            OperationKind::Insert => ProbeCall::Insert,
            OperationKind::CustomInsert => ProbeCall::InsertionIndex,
        }
    }

    /// Key handling that runs before the probe.
    pub fn key_steps(&self) -> Vec<KeyStep> {
        let inserts = self.descriptor.kind.inserts();
        let markers = if inserts {
            KeyStep::RebindMarkers
        } else {
            KeyStep::CheckMarkers
        };
        match self.shape.key {
            Domain::Reference { nullable: true } => {
                vec![KeyStep::NullCheck(NullPath::DedicatedSlot)]
            }
            Domain::Reference { nullable: false } if inserts => {
                vec![KeyStep::NullCheck(NullPath::Reject)]
            }
            Domain::Reference { nullable: false } => vec![KeyStep::NullCheck(NullPath::Absent)],
            Domain::FloatingPoint { .. } => vec![KeyStep::NormalizeFloat, markers],
            Domain::Integral { .. } => vec![markers],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OperationSpecializer {
    config: SpecializerConfig,
}

impl OperationSpecializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SpecializerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SpecializerConfig {
        &self.config
    }

    /// Specializes one of the built-in operations.
    pub fn specialize(
        &self,
        descriptor: OperationDescriptor,
        shape: TableShape,
    ) -> Result<SpecializedOp, SpecializeError> {
        self.specialize_with(descriptor, shape, &BuiltinBody)
    }

    pub fn specialize_with(
        &self,
        descriptor: OperationDescriptor,
        shape: TableShape,
        source: &dyn BodySource,
    ) -> Result<SpecializedOp, SpecializeError> {
        let kind = descriptor.kind;
        if kind == OperationKind::ReplaceValue && !shape.is_map() {
            return Err(SpecializeError::Unsupported {
                kind,
                reason: "key sets have no values to replace",
            });
        }
        let mut ctx = SpecContext::new(descriptor, shape, &self.config);

        let measured = BranchCostAnalyzer.measure(&ctx.body, source);
        if measured.present.is_empty() && measured.absent.is_empty() {
            return Err(SpecializeError::BothBranchesEmpty { kind });
        }
        ctx.advance(Stage::Measured);

        let layout = choose_layout(&ctx, &measured);
        ctx.advance(Stage::LayoutChosen);

        let mut present = resynthesize(&ctx, source, Branch::Present, &measured)?;
        let mut absent = resynthesize(&ctx, source, Branch::Absent, &measured)?;
        let mut lifted = Vec::new();
        let scan = matches!(layout.decision, Decision::Scan(_));
        let rounds = self.config.hoist_rounds;
        let hoisted = hoist(&mut lifted, &mut present, &mut absent, rounds, scan);
        ctx.advance(Stage::Hoisted);

        if layout.share_array {
            lifted.insert(0, Stmt::Let(Local::Values, Expr::Array(ArrayRef::Field)));
            rewrite_array_refs(&mut lifted[1..]);
        }
        let threshold = self.config.capture_threshold;
        materialize(&mut present, Branch::Present, layout.share_array, threshold)?;
        materialize(&mut absent, Branch::Absent, layout.share_array, threshold)?;
        // Identical value captures on both sides run once, after the probe.
        hoist(&mut lifted, &mut present, &mut absent, rounds.saturating_sub(hoisted), scan);
        ctx.advance(Stage::Materialized);

        let plan = BranchPlan {
            key_steps: ctx.key_steps(),
            lifted,
            decision: layout.decision,
            present: Segment {
                branch: Branch::Present,
                stmts: present,
                label: layout.present_label,
            },
            absent: Segment {
                branch: Branch::Absent,
                stmts: absent,
                label: layout.absent_label,
            },
            blocks: layout.blocks,
        };
        let permissions = resolve_permissions(&plan);
        if !permissions.is_subset(&shape.mutability.permissions()) {
            return Err(SpecializeError::Unsupported {
                kind,
                reason: "needs capabilities the table's mutability does not grant",
            });
        }
        ctx.advance(Stage::Finalized);
        tracing::debug!(
            ?kind,
            key = %shape.key,
            inline = descriptor.inline,
            decision = ?plan.decision,
            lifted = plan.lifted.len(),
            blocks = plan.blocks.len(),
            "operation specialized"
        );
        Ok(SpecializedOp {
            descriptor,
            plan,
            permissions,
        })
    }
}

/// Specializes a built-in operation with the default configuration.
pub fn specialize(
    descriptor: OperationDescriptor,
    shape: TableShape,
) -> Result<SpecializedOp, SpecializeError> {
    OperationSpecializer::new().specialize(descriptor, shape)
}

fn choose_layout(ctx: &SpecContext<'_>, m: &Measurements) -> Layout {
    let desc = &ctx.descriptor;
    let mut blocks = SlotMap::with_key();
    let share_array = m.present.array_refs > 0 && m.absent.array_refs > 0;

    if !desc.inline {
        let decision = match (m.present.is_empty(), m.absent.is_empty()) {
            (true, _) => Decision::Guard {
                probe: ctx.probe_call(),
                branch: Branch::Absent,
            },
            (_, true) => Decision::Guard {
                probe: ctx.probe_call(),
                branch: Branch::Present,
            },
            _ => Decision::Split {
                probe: ctx.probe_call(),
                primary: desc.most_probable,
            },
        };
        return Layout {
            decision,
            blocks,
            present_label: None,
            absent_label: None,
            share_array,
        };
    }

    let mut exit = |branch: Branch| {
        let metrics = m.get(branch);
        if metrics.is_empty() {
            (Exit::Fallthrough, None)
        } else if metrics.statements > ctx.config.extract_threshold {
            let id = blocks.insert(branch);
            (Exit::Jump(id), Some(id))
        } else {
            (Exit::Inline, None)
        }
    };
    let (present, present_label) = exit(Branch::Present);
    let (absent, absent_label) = exit(Branch::Absent);
    let tombstones = ctx.shape.mutability.has_tombstones();
    Layout {
        decision: Decision::Scan(ScanPlan {
            first_check: desc.most_probable,
            skip_tombstones: tombstones,
            track_first_tombstone: tombstones && desc.kind.inserts(),
            present,
            absent,
        }),
        blocks,
        present_label,
        absent_label,
        share_array,
    }
}

fn resynthesize(
    ctx: &SpecContext<'_>,
    source: &dyn BodySource,
    branch: Branch,
    measured: &Measurements,
) -> Result<Vec<Stmt>, SpecializeError> {
    let stmts = synthesize(&ctx.body, source, branch);
    let actual = BranchMetrics::of(&stmts);
    let expected = measured.get(branch);
    if actual != expected {
        return Err(SpecializeError::UsageMismatch {
            branch,
            measured: expected,
            actual,
        });
    }
    Ok(stmts)
}

/// Lifts structurally equal leading statements of both segments into
/// `lifted`, at most `rounds` times. Returns the number lifted.
fn hoist(
    lifted: &mut Vec<Stmt>,
    present: &mut Vec<Stmt>,
    absent: &mut Vec<Stmt>,
    rounds: usize,
    scan: bool,
) -> usize {
    let mut n = 0;
    while n < rounds {
        let (Some(p), Some(a)) = (present.first(), absent.first()) else {
            break;
        };
        // Never empty a segment; under an inline scan the lifted prefix runs
        // before the probe.
        if p != a
            || p.is_terminator()
            || present.len() == 1
            || absent.len() == 1
            || (scan && p.depends_on_probe())
        {
            break;
        }
        lifted.push(present.remove(0));
        absent.remove(0);
        n += 1;
    }
    n
}

/// Captures storage reads used `threshold` times or more into locals at the
/// top of the segment.
fn materialize(
    stmts: &mut Vec<Stmt>,
    branch: Branch,
    share_array: bool,
    threshold: usize,
) -> Result<(), SpecializeError> {
    let refs = StorageRefs::of(stmts);
    if refs.value_reads >= threshold {
        if let Some(index) = read_after_write(stmts) {
            return Err(SpecializeError::StaleCapture { branch, index });
        }
        rewrite_value_reads(stmts);
        stmts.insert(0, Stmt::Let(Local::Value, Expr::CurrentValue(ArrayRef::Field)));
    }
    if share_array {
        rewrite_array_refs(stmts);
    } else if StorageRefs::of(stmts).array_refs >= threshold {
        rewrite_array_refs(stmts);
        stmts.insert(0, Stmt::Let(Local::Values, Expr::Array(ArrayRef::Field)));
    }
    Ok(())
}

fn resolve_permissions(plan: &BranchPlan) -> PermissionSet {
    let mut perms = PermissionSet::new();
    let stmts = plan.lifted.iter().chain(&plan.present.stmts).chain(&plan.absent.stmts);
    for p in stmts.filter_map(Stmt::permission) {
        perms.insert(p);
    }
    if matches!(
        plan.decision,
        Decision::Split {
            probe: ProbeCall::Insert,
            ..
        } | Decision::Guard {
            probe: ProbeCall::Insert,
            ..
        }
    ) {
        perms.insert(Permission::Insert);
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::BodyBuilder;
    use crate::domain::Width;
    use std::cell::Cell;

    fn i32_map(mutability: Mutability) -> TableShape {
        TableShape::map(
            Domain::int(Width::W32, true),
            Domain::int(Width::W32, true),
            mutability,
        )
    }

    /// Shared prefix of `k` statements, then diverging returns.
    struct Prefixed(usize);

    impl Prefixed {
        fn prefix(&self, b: &mut BodyBuilder<'_>) {
            for i in 0..self.0 {
                b.push(Stmt::Let(Local::Temp(i as u8), Expr::Const(i as i64)));
            }
        }
    }

    impl BodySource for Prefixed {
        fn present(&self, b: &mut BodyBuilder<'_>) {
            self.prefix(b);
            b.ret(Expr::Bool(true));
        }

        fn absent(&self, b: &mut BodyBuilder<'_>) {
            self.prefix(b);
            b.ret(Expr::Bool(false));
        }
    }

    /// Invariant: a common prefix of length k (k ≤ 3) is lifted whole and not
    /// repeated in either segment.
    #[test]
    fn hoisting_law() {
        for k in 0..=3 {
            for inline in [false, true] {
                let desc = OperationDescriptor::new(OperationKind::Lookup).inline(inline);
                let op = OperationSpecializer::new()
                    .specialize_with(desc, i32_map(Mutability::Mutable), &Prefixed(k))
                    .unwrap();
                assert_eq!(op.plan.lifted.len(), k, "k={k} inline={inline}");
                for seg in [&op.plan.present, &op.plan.absent] {
                    assert_eq!(seg.stmts.len(), 1);
                    assert!(op.plan.lifted.iter().all(|s| !seg.stmts.contains(s)));
                }
            }
        }
    }

    /// Invariant: hoisting stops after the configured number of rounds.
    #[test]
    fn hoisting_is_bounded() {
        let op = OperationSpecializer::new()
            .specialize_with(
                OperationDescriptor::new(OperationKind::Lookup),
                i32_map(Mutability::Mutable),
                &Prefixed(5),
            )
            .unwrap();
        assert_eq!(op.plan.lifted.len(), 3);
        assert_eq!(op.plan.present.stmts.len(), 3);
    }

    /// Reads the current value `n` times in the present body.
    struct Reads(usize);

    impl BodySource for Reads {
        fn present(&self, b: &mut BodyBuilder<'_>) {
            for i in 0..self.0.saturating_sub(1) {
                let v = b.current_value();
                b.push(Stmt::Let(Local::Temp(i as u8), v));
            }
            let v = b.current_value();
            b.ret(Expr::wrap(v));
        }

        fn absent(&self, b: &mut BodyBuilder<'_>) {
            b.ret(Expr::Default);
        }
    }

    fn value_captures(stmts: &[Stmt]) -> usize {
        stmts
            .iter()
            .filter(|s| matches!(s, Stmt::Let(Local::Value, Expr::CurrentValue(_))))
            .count()
    }

    /// Invariant: two or more value reads give exactly one capture and no
    /// remaining direct reads; a single read stays direct.
    #[test]
    fn materialization_law() {
        let specializer = OperationSpecializer::new();
        let desc = OperationDescriptor::new(OperationKind::Lookup);

        let once = specializer
            .specialize_with(desc, i32_map(Mutability::Mutable), &Reads(1))
            .unwrap();
        assert_eq!(value_captures(&once.plan.present.stmts), 0);
        assert_eq!(StorageRefs::of(&once.plan.present.stmts).value_reads, 1);

        for n in [2, 3] {
            let many = specializer
                .specialize_with(desc, i32_map(Mutability::Mutable), &Reads(n))
                .unwrap();
            let stmts = &many.plan.present.stmts;
            let capture = stmts
                .iter()
                .position(|s| matches!(s, Stmt::Let(Local::Value, _)))
                .expect("value captured");
            assert_eq!(value_captures(stmts), 1);
            assert_eq!(StorageRefs::of(&stmts[capture + 1..]).value_reads, 0);
        }
    }

    struct ReadAfterStore;

    impl BodySource for ReadAfterStore {
        fn present(&self, b: &mut BodyBuilder<'_>) {
            let v = b.current_value();
            b.push(Stmt::Let(Local::Prev, v.clone()))
                .store_value(Expr::ValueArg)
                .ret(Expr::wrap(v));
        }

        fn absent(&self, b: &mut BodyBuilder<'_>) {
            b.ret(Expr::Default);
        }
    }

    /// Invariant: capturing a value that a store already overwrote is rejected.
    #[test]
    fn capture_after_store_is_stale() {
        let err = OperationSpecializer::new()
            .specialize_with(
                OperationDescriptor::new(OperationKind::ReplaceValue),
                i32_map(Mutability::Mutable),
                &ReadAfterStore,
            )
            .unwrap_err();
        assert_eq!(
            err,
            SpecializeError::StaleCapture {
                branch: Branch::Present,
                index: 2
            }
        );
    }

    struct Nothing;

    impl BodySource for Nothing {
        fn present(&self, _: &mut BodyBuilder<'_>) {}
        fn absent(&self, _: &mut BodyBuilder<'_>) {}
    }

    #[test]
    fn both_branches_empty_is_fatal() {
        let err = specialize_err(&Nothing);
        assert_eq!(
            err,
            SpecializeError::BothBranchesEmpty {
                kind: OperationKind::Lookup
            }
        );
    }

    fn specialize_err(source: &dyn BodySource) -> SpecializeError {
        OperationSpecializer::new()
            .specialize_with(
                OperationDescriptor::new(OperationKind::Lookup),
                i32_map(Mutability::Mutable),
                source,
            )
            .unwrap_err()
    }

    /// Grows its present body on every call.
    struct Drifting(Cell<usize>);

    impl BodySource for Drifting {
        fn present(&self, b: &mut BodyBuilder<'_>) {
            self.0.set(self.0.get() + 1);
            for _ in 0..self.0.get() {
                b.push(Stmt::Let(Local::Temp(0), Expr::Const(0)));
            }
            b.ret(Expr::Bool(true));
        }

        fn absent(&self, b: &mut BodyBuilder<'_>) {
            b.ret(Expr::Bool(false));
        }
    }

    /// Invariant: a body source that is not deterministic is caught between
    /// measurement and synthesis.
    #[test]
    fn drifting_body_is_a_usage_mismatch() {
        let err = specialize_err(&Drifting(Cell::new(0)));
        assert!(matches!(
            err,
            SpecializeError::UsageMismatch {
                branch: Branch::Present,
                ..
            }
        ));
    }

    /// Only the absent branch has statements.
    struct AbsentOnly;

    impl BodySource for AbsentOnly {
        fn present(&self, _: &mut BodyBuilder<'_>) {}
        fn absent(&self, b: &mut BodyBuilder<'_>) {
            b.ret(Expr::Default);
        }
    }

    /// Invariant: one empty branch turns the decision into a guard (no
    /// decision point) or a fallthrough exit of the scan.
    #[test]
    fn empty_branch_becomes_guard() {
        let specializer = OperationSpecializer::new();
        let shape = i32_map(Mutability::Mutable);
        let op = specializer
            .specialize_with(
                OperationDescriptor::new(OperationKind::Lookup),
                shape,
                &AbsentOnly,
            )
            .unwrap();
        assert_eq!(
            op.plan.decision,
            Decision::Guard {
                probe: ProbeCall::Index,
                branch: Branch::Absent
            }
        );
        assert_eq!(op.plan.decision_points(), 0);

        let op = specializer
            .specialize_with(
                OperationDescriptor::new(OperationKind::Lookup).inline(true),
                shape,
                &AbsentOnly,
            )
            .unwrap();
        match &op.plan.decision {
            Decision::Scan(scan) => assert_eq!(scan.present, Exit::Fallthrough),
            other => panic!("expected scan, got {other:?}"),
        }
        assert_eq!(op.plan.decision_points(), 0);
    }

    /// Invariant: the likelier branch is primary.
    #[test]
    fn most_probable_branch_is_primary() {
        for branch in [Branch::Present, Branch::Absent] {
            let op = specialize(
                OperationDescriptor::new(OperationKind::Lookup).most_probable(branch),
                i32_map(Mutability::Mutable),
            )
            .unwrap();
            assert_eq!(
                op.plan.decision,
                Decision::Split {
                    probe: ProbeCall::Index,
                    primary: branch
                }
            );
        }
    }

    /// Invariant: inline plans extract multi-statement branches behind a
    /// label and inline single statements.
    #[test]
    fn inline_extraction_threshold() {
        let op = specialize(
            OperationDescriptor::new(OperationKind::Insert).inline(true),
            i32_map(Mutability::Mutable),
        )
        .unwrap();
        let Decision::Scan(scan) = &op.plan.decision else {
            panic!("inline plans scan");
        };
        let Exit::Jump(present) = scan.present else {
            panic!("three-statement present body is extracted");
        };
        assert_eq!(op.plan.block(present), Some(&op.plan.present));
        assert!(matches!(scan.absent, Exit::Jump(_)));
        assert!(scan.track_first_tombstone);
        assert_eq!(op.plan.blocks.len(), 2);
    }

    /// Invariant: when both branches touch the value array, one capture is
    /// shared in the lifted prefix and no segment uses the field directly.
    #[test]
    fn shared_array_capture() {
        let op = specialize(
            OperationDescriptor::new(OperationKind::Insert).inline(true),
            i32_map(Mutability::Mutable),
        )
        .unwrap();
        assert_eq!(
            op.plan.lifted,
            vec![Stmt::Let(Local::Values, Expr::Array(ArrayRef::Field))]
        );
        for seg in [&op.plan.present, &op.plan.absent] {
            assert_eq!(StorageRefs::of(&seg.stmts).array_refs, 0);
        }
    }

    /// Invariant: the out-of-line custom insert lifts its index capture.
    #[test]
    fn custom_insert_lifts_index_capture() {
        let op = specialize(
            OperationDescriptor::new(OperationKind::CustomInsert),
            i32_map(Mutability::Updatable),
        )
        .unwrap();
        // Both bodies also touch the value array, so its capture leads.
        assert_eq!(
            op.plan.lifted,
            vec![
                Stmt::Let(Local::Values, Expr::Array(ArrayRef::Field)),
                Stmt::Let(Local::Index, Expr::InsertionSlot),
            ]
        );
        for seg in [&op.plan.present, &op.plan.absent] {
            assert!(!matches!(seg.stmts[0], Stmt::Let(Local::Index, _)));
        }
        assert_eq!(
            op.plan.decision,
            Decision::Split {
                probe: ProbeCall::InsertionIndex,
                primary: Branch::Present
            }
        );
    }

    /// Reads the stored value twice on both sides.
    struct RereadsValue;

    impl BodySource for RereadsValue {
        fn present(&self, b: &mut BodyBuilder<'_>) {
            let v = b.current_value();
            b.push(Stmt::Let(Local::Temp(0), v.clone())).ret(Expr::wrap(v));
        }

        fn absent(&self, b: &mut BodyBuilder<'_>) {
            let v = b.current_value();
            b.push(Stmt::Let(Local::Temp(1), v.clone()))
                .push(Stmt::Let(Local::Temp(2), v))
                .ret(Expr::Default);
        }
    }

    /// Invariant: a value capture made by both segments is lifted once,
    /// behind the shared array capture.
    #[test]
    fn custom_insert_lifts_value_capture() {
        let op = OperationSpecializer::new()
            .specialize_with(
                OperationDescriptor::new(OperationKind::CustomInsert),
                i32_map(Mutability::Updatable),
                &RereadsValue,
            )
            .unwrap();
        assert_eq!(
            op.plan.lifted,
            vec![
                Stmt::Let(Local::Values, Expr::Array(ArrayRef::Field)),
                Stmt::Let(Local::Value, Expr::CurrentValue(ArrayRef::Local)),
            ]
        );
        assert_eq!(
            op.plan.present.stmts,
            vec![
                Stmt::Let(Local::Temp(0), Expr::Local(Local::Value)),
                Stmt::Return(Expr::wrap(Expr::Local(Local::Value))),
            ]
        );
        assert_eq!(value_captures(&op.plan.absent.stmts), 0);
        assert_eq!(StorageRefs::of(&op.plan.absent.stmts).value_reads, 0);

        // Under an inline scan the capture needs the probed slot and stays put.
        let op = OperationSpecializer::new()
            .specialize_with(
                OperationDescriptor::new(OperationKind::CustomInsert).inline(true),
                i32_map(Mutability::Updatable),
                &RereadsValue,
            )
            .unwrap();
        assert_eq!(value_captures(&op.plan.lifted), 0);
        for seg in [&op.plan.present, &op.plan.absent] {
            assert_eq!(value_captures(&seg.stmts), 1);
        }
    }

    /// Invariant: hoisting before and after materialization shares one bound.
    #[test]
    fn value_capture_counts_against_hoist_rounds() {
        let config = SpecializerConfig {
            hoist_rounds: 0,
            ..SpecializerConfig::default()
        };
        let op = OperationSpecializer::with_config(config)
            .specialize_with(
                OperationDescriptor::new(OperationKind::CustomInsert),
                i32_map(Mutability::Updatable),
                &RereadsValue,
            )
            .unwrap();
        assert_eq!(value_captures(&op.plan.lifted), 0);
        assert_eq!(value_captures(&op.plan.present.stmts), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "after")]
    fn stages_only_move_forward() {
        let cfg = SpecializerConfig::default();
        let mut ctx = SpecContext::new(
            OperationDescriptor::new(OperationKind::Lookup),
            i32_map(Mutability::Mutable),
            &cfg,
        );
        ctx.advance(Stage::Hoisted);
        ctx.advance(Stage::Measured);
    }

    /// Invariant: permissions follow the statements of the plan.
    #[test]
    fn permission_resolution() {
        let shape = i32_map(Mutability::Mutable);
        let perms = |kind| {
            specialize(OperationDescriptor::new(kind), shape)
                .unwrap()
                .permissions
        };
        assert!(perms(OperationKind::Lookup).is_empty());
        assert_eq!(
            perms(OperationKind::Insert),
            PermissionSet::of(&[Permission::Insert, Permission::SetValue])
        );
        assert_eq!(
            perms(OperationKind::Remove),
            PermissionSet::of(&[Permission::Remove])
        );
        assert_eq!(
            perms(OperationKind::ReplaceValue),
            PermissionSet::of(&[Permission::SetValue])
        );
        assert_eq!(
            perms(OperationKind::CustomInsert),
            PermissionSet::of(&[Permission::Insert])
        );
    }

    /// Invariant: shapes that cannot support an operation reject it.
    #[test]
    fn unsupported_combinations() {
        let set = TableShape::set(Domain::int(Width::W8, false), Mutability::Mutable);
        assert!(matches!(
            specialize(OperationDescriptor::new(OperationKind::ReplaceValue), set),
            Err(SpecializeError::Unsupported { .. })
        ));
        assert!(matches!(
            specialize(
                OperationDescriptor::new(OperationKind::Remove),
                i32_map(Mutability::Updatable)
            ),
            Err(SpecializeError::Unsupported { .. })
        ));
        assert!(matches!(
            specialize(
                OperationDescriptor::new(OperationKind::Insert),
                i32_map(Mutability::Immutable)
            ),
            Err(SpecializeError::Unsupported { .. })
        ));
    }

    #[test]
    fn key_steps_per_domain() {
        let cfg = SpecializerConfig::default();
        let steps = |kind, key| {
            SpecContext::new(
                OperationDescriptor::new(kind),
                TableShape::set(key, Mutability::Mutable),
                &cfg,
            )
            .key_steps()
        };
        assert_eq!(
            steps(OperationKind::Lookup, Domain::float32()),
            vec![KeyStep::NormalizeFloat, KeyStep::CheckMarkers]
        );
        assert_eq!(
            steps(OperationKind::Insert, Domain::int(Width::W16, false)),
            vec![KeyStep::RebindMarkers]
        );
        assert_eq!(
            steps(OperationKind::Insert, Domain::reference(false)),
            vec![KeyStep::NullCheck(NullPath::Reject)]
        );
        assert_eq!(
            steps(OperationKind::Lookup, Domain::reference(false)),
            vec![KeyStep::NullCheck(NullPath::Absent)]
        );
    }
}

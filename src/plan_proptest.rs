#![cfg(test)]

// Property tests for the specializer kept inside the crate so they can
// build contrived bodies against internal builders.

use crate::analyzer::{BodyBuilder, BodySource};
use crate::domain::{Domain, Width};
use crate::ir::{Branch, Decision, Exit, Expr, KeyStep, Local, OperationKind, Stmt};
use crate::specializer::{
    specialize, Mutability, OperationDescriptor, OperationSpecializer, SpecializeError,
    SpecializedOp, TableShape,
};
use proptest::prelude::*;

fn arb_domain() -> impl Strategy<Value = Domain> {
    let width = prop_oneof![
        Just(Width::W8),
        Just(Width::W16),
        Just(Width::W32),
        Just(Width::W64)
    ];
    prop_oneof![
        (width, any::<bool>()).prop_map(|(w, s)| Domain::int(w, s)),
        Just(Domain::float32()),
        Just(Domain::float64()),
        any::<bool>().prop_map(Domain::reference),
    ]
}

fn arb_shape() -> impl Strategy<Value = TableShape> {
    let mutability = prop_oneof![
        Just(Mutability::Immutable),
        Just(Mutability::Updatable),
        Just(Mutability::Mutable)
    ];
    (arb_domain(), proptest::option::of(arb_domain()), mutability).prop_map(
        |(key, value, mutability)| TableShape {
            key,
            value,
            mutability,
        },
    )
}

fn arb_descriptor() -> impl Strategy<Value = OperationDescriptor> {
    let kind = proptest::sample::select(OperationKind::ALL.to_vec());
    let branch = prop_oneof![Just(Branch::Present), Just(Branch::Absent)];
    (kind, branch, any::<bool>()).prop_map(|(k, b, inline)| {
        OperationDescriptor::new(k)
            .most_probable(b)
            .inline(inline)
    })
}

/// `None` for combinations the shape rejects.
fn try_specialize(desc: OperationDescriptor, shape: TableShape) -> Option<SpecializedOp> {
    match specialize(desc, shape) {
        Err(SpecializeError::Unsupported { .. }) => None,
        other => Some(other.expect("built-in bodies always specialize")),
    }
}

/// Shared prefix of `k` statements, then `present_tail` / `absent_tail`
/// statements before diverging returns.
struct Contrived {
    k: usize,
    present_tail: usize,
    absent_tail: usize,
}

impl Contrived {
    fn fill(b: &mut BodyBuilder<'_>, k: usize, tail: usize, tag: i64) {
        for i in 0..k {
            b.push(Stmt::Let(Local::Temp(i as u8), Expr::Const(i as i64)));
        }
        for i in 0..tail {
            b.push(Stmt::Let(Local::Temp(100 + i as u8), Expr::Const(tag)));
        }
        b.ret(Expr::Const(tag));
    }
}

impl BodySource for Contrived {
    fn present(&self, b: &mut BodyBuilder<'_>) {
        Self::fill(b, self.k, self.present_tail, 1);
    }

    fn absent(&self, b: &mut BodyBuilder<'_>) {
        Self::fill(b, self.k, self.absent_tail, 2);
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    // Two runs over the same inputs give structurally identical plans.
    #[test]
    fn prop_specialization_is_deterministic(desc in arb_descriptor(), shape in arb_shape()) {
        let a = try_specialize(desc, shape);
        let b = try_specialize(desc, shape);
        prop_assert_eq!(a, b);
    }

    // One decision point with two non-empty, disjoint segments; labels
    // resolve to the segment of their own branch; permissions stay within
    // the shape.
    #[test]
    fn prop_plan_shape(desc in arb_descriptor(), shape in arb_shape()) {
        let Some(op) = try_specialize(desc, shape) else { return Ok(()); };
        let plan = &op.plan;
        prop_assert_eq!(plan.present.branch, Branch::Present);
        prop_assert_eq!(plan.absent.branch, Branch::Absent);
        prop_assert!(!plan.present.is_empty() && !plan.absent.is_empty());
        prop_assert_eq!(plan.decision_points(), 1);
        for s in &plan.present.stmts {
            prop_assert!(!plan.absent.stmts.contains(s), "{:?} in both segments", s);
        }
        prop_assert!(op.permissions.is_subset(&shape.mutability.permissions()));

        match &plan.decision {
            Decision::Scan(scan) => {
                prop_assert!(desc.inline);
                prop_assert_eq!(scan.first_check, desc.most_probable);
                for branch in [Branch::Present, Branch::Absent] {
                    match scan.exit(branch) {
                        Exit::Jump(id) => {
                            prop_assert_eq!(plan.blocks.get(id).copied(), Some(branch));
                            prop_assert_eq!(plan.segment(branch).label, Some(id));
                        }
                        Exit::Inline => prop_assert_eq!(plan.segment(branch).label, None),
                        Exit::Fallthrough => prop_assert!(false, "built-in bodies are never empty"),
                    }
                }
            }
            Decision::Split { primary, .. } => {
                prop_assert!(!desc.inline);
                prop_assert_eq!(*primary, desc.most_probable);
                prop_assert!(plan.blocks.is_empty());
            }
            Decision::Guard { .. } => prop_assert!(false, "built-in bodies are never empty"),
        }
    }

    // Float keys are normalized exactly once, before anything else; only
    // reference keys get a null check.
    #[test]
    fn prop_key_steps(desc in arb_descriptor(), shape in arb_shape()) {
        let Some(op) = try_specialize(desc, shape) else { return Ok(()); };
        let steps = &op.plan.key_steps;
        let normalizations = op.plan.count_key_steps(KeyStep::NormalizeFloat);
        match shape.key {
            Domain::FloatingPoint { .. } => {
                prop_assert_eq!(normalizations, 1);
                prop_assert_eq!(steps[0], KeyStep::NormalizeFloat);
            }
            Domain::Reference { .. } => {
                prop_assert_eq!(steps.len(), 1);
                prop_assert!(matches!(steps[0], KeyStep::NullCheck(_)));
            }
            Domain::Integral { .. } => prop_assert_eq!(normalizations, 0),
        }
    }

    // Lifted prefix length is the common prefix length, bounded by the
    // number of hoisting rounds, and the segments never repeat it.
    #[test]
    fn prop_hoisting_bound(
        k in 0usize..6,
        present_tail in 0usize..3,
        absent_tail in 0usize..3,
        inline in any::<bool>(),
    ) {
        let specializer = OperationSpecializer::new();
        let shape = TableShape::map(
            Domain::int(Width::W32, true),
            Domain::int(Width::W32, true),
            Mutability::Mutable,
        );
        let desc = OperationDescriptor::new(OperationKind::Lookup).inline(inline);
        let op = specializer
            .specialize_with(desc, shape, &Contrived { k, present_tail, absent_tail })
            .unwrap();
        let rounds = specializer.config().hoist_rounds;
        // Tails differ from their first statement on.
        prop_assert_eq!(op.plan.lifted.len(), k.min(rounds));
        for seg in [&op.plan.present, &op.plan.absent] {
            prop_assert!(!seg.is_empty());
            prop_assert!(seg.stmts.last().is_some_and(Stmt::is_terminator));
            for s in &op.plan.lifted {
                prop_assert!(!seg.stmts.contains(s));
            }
        }
    }
}

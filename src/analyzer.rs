//! Dry-run measurement of present/absent bodies.
//!
//! A [`BodySource`] writes one branch body into a fresh [`BodyBuilder`]. The
//! analyzer runs each callback once in isolation and keeps only counts; the
//! specializer re-synthesizes the real bodies after the layout is fixed and
//! checks that the counts did not move.

use crate::domain::Domain;
use crate::ir::{ArrayRef, Branch, Expr, Local, OperationKind, Stmt, StorageRefs};

/// Facts a body source may consult while writing a body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BodyContext {
    pub kind: OperationKind,
    pub key: Domain,
    /// `None` for bare key sets.
    pub value: Option<Domain>,
    /// Whether the probe loop is expanded inline.
    pub inline: bool,
}

impl BodyContext {
    pub fn is_map(&self) -> bool {
        self.value.is_some()
    }
}

/// Produces the statements of the present and absent branches.
///
/// Implementations must be free of side effects on shared state: every call
/// for the same context has to produce the same statements.
pub trait BodySource {
    fn present(&self, body: &mut BodyBuilder<'_>);
    fn absent(&self, body: &mut BodyBuilder<'_>);
}

/// Append-only buffer for one branch body.
pub struct BodyBuilder<'c> {
    ctx: &'c BodyContext,
    branch: Branch,
    stmts: Vec<Stmt>,
}

impl<'c> BodyBuilder<'c> {
    pub fn new(ctx: &'c BodyContext, branch: Branch) -> Self {
        Self {
            ctx,
            branch,
            stmts: Vec::new(),
        }
    }

    pub fn context(&self) -> &BodyContext {
        self.ctx
    }

    pub fn branch(&self) -> Branch {
        self.branch
    }

    pub fn push(&mut self, stmt: Stmt) -> &mut Self {
        self.stmts.push(stmt);
        self
    }

    /// `values[index]`, read straight from storage.
    pub fn current_value(&self) -> Expr {
        Expr::CurrentValue(ArrayRef::Field)
    }

    /// `prev = values[index]`
    pub fn capture_prev(&mut self) -> &mut Self {
        self.push(Stmt::Let(Local::Prev, Expr::CurrentValue(ArrayRef::Field)))
    }

    pub fn store_value(&mut self, value: Expr) -> &mut Self {
        self.push(Stmt::StoreValue {
            array: ArrayRef::Field,
            value,
        })
    }

    /// Stores the probed key (and the value argument, for maps) at `index`.
    pub fn insert_key(&mut self) -> &mut Self {
        let value = self.ctx.is_map().then_some((ArrayRef::Field, Expr::ValueArg));
        self.push(Stmt::InsertAt {
            key: Expr::Key,
            value,
        })
    }

    /// Tombstones `index`. Reference values are cleared so the slot does not
    /// keep them alive.
    pub fn remove_key(&mut self) -> &mut Self {
        let clear_value = matches!(self.ctx.value, Some(Domain::Reference { .. }))
            .then_some(ArrayRef::Field);
        self.push(Stmt::RemoveAt { clear_value })
    }

    pub fn ret(&mut self, e: Expr) -> &mut Self {
        self.push(Stmt::Return(e))
    }

    pub fn finish(self) -> Vec<Stmt> {
        self.stmts
    }
}

/// Runs one callback of `source` into a fresh builder.
pub fn synthesize(ctx: &BodyContext, source: &dyn BodySource, branch: Branch) -> Vec<Stmt> {
    let mut b = BodyBuilder::new(ctx, branch);
    match branch {
        Branch::Present => source.present(&mut b),
        Branch::Absent => source.absent(&mut b),
    }
    b.finish()
}

/// Size and storage usage of one branch body.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BranchMetrics {
    pub statements: usize,
    pub value_reads: usize,
    pub array_refs: usize,
}

impl BranchMetrics {
    pub fn of(stmts: &[Stmt]) -> Self {
        let refs = StorageRefs::of(stmts);
        Self {
            statements: stmts.len(),
            value_reads: refs.value_reads,
            array_refs: refs.array_refs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statements == 0
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Measurements {
    pub present: BranchMetrics,
    pub absent: BranchMetrics,
}

impl Measurements {
    pub fn get(&self, branch: Branch) -> BranchMetrics {
        match branch {
            Branch::Present => self.present,
            Branch::Absent => self.absent,
        }
    }
}

/// Stateless; two runs over the same inputs give the same counts.
#[derive(Copy, Clone, Debug, Default)]
pub struct BranchCostAnalyzer;

impl BranchCostAnalyzer {
    pub fn measure(&self, ctx: &BodyContext, source: &dyn BodySource) -> Measurements {
        Measurements {
            present: BranchMetrics::of(&synthesize(ctx, source, Branch::Present)),
            absent: BranchMetrics::of(&synthesize(ctx, source, Branch::Absent)),
        }
    }
}

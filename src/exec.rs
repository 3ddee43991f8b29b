//! Interpreter for [`BranchPlan`]s over a [`SlotStore`].
//!
//! Running a plan: convert the key to its stored form, run the key steps,
//! locate the key (probe primitive or inline scan), execute the lifted
//! prefix and then the segment of the branch that was taken. Jumps of an
//! inline scan are resolved through the plan's block table.

use crate::domain::{Datum, DomainError};
use crate::ir::{
    ArrayRef, Branch, BranchPlan, Decision, Exit, Expr, KeyStep, Local, NullPath, ProbeCall, Stmt,
};
use crate::probe::{ProbeError, ScanOutcome};
use crate::store::{SlotIndex, SlotStore, StoreError};
use core::hash::BuildHasher;
use hashbrown::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error("plan reads {0:?} before binding it")]
    UnboundLocal(Local),
    #[error("plan writes through a read-only table handle")]
    ReadOnly,
    #[error("null keys are not permitted in this table")]
    NullKey,
    #[error("malformed plan: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read or read-write handle on a store.
pub trait SlotAccess<S> {
    fn slots(&self) -> &SlotStore<S>;
    fn slots_mut(&mut self) -> Result<&mut SlotStore<S>, ExecError>;
}

impl<S> SlotAccess<S> for &SlotStore<S> {
    fn slots(&self) -> &SlotStore<S> {
        *self
    }

    fn slots_mut(&mut self) -> Result<&mut SlotStore<S>, ExecError> {
        Err(ExecError::ReadOnly)
    }
}

impl<S> SlotAccess<S> for &mut SlotStore<S> {
    fn slots(&self) -> &SlotStore<S> {
        &**self
    }

    fn slots_mut(&mut self) -> Result<&mut SlotStore<S>, ExecError> {
        Ok(&mut **self)
    }
}

/// Runtime value of a plan expression.
#[derive(Clone, Debug, PartialEq)]
enum Bound {
    Datum(Datum),
    Slot(SlotIndex),
    /// Handle on the value array.
    Array,
}

/// Where the key is looked up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Route {
    Probe,
    NullSlot,
    /// The key cannot be stored: answer from the absent segment.
    Absent,
}

struct Frame<'a> {
    key: Datum,
    value: Option<Datum>,
    locals: HashMap<Local, Bound>,
    plan: &'a BranchPlan,
}

impl Frame<'_> {
    fn local(&self, l: Local) -> Result<&Bound, ExecError> {
        self.locals.get(&l).ok_or(ExecError::UnboundLocal(l))
    }

    fn slot(&self) -> Result<SlotIndex, ExecError> {
        match self.local(Local::Index)? {
            Bound::Slot(s) => Ok(*s),
            _ => Err(ExecError::Malformed("index local holds no slot")),
        }
    }

    fn array(&self, a: ArrayRef) -> Result<(), ExecError> {
        match a {
            ArrayRef::Field => Ok(()),
            ArrayRef::Local => match self.local(Local::Values)? {
                Bound::Array => Ok(()),
                _ => Err(ExecError::Malformed("values local holds no array")),
            },
        }
    }
}

/// Runs `plan` for `key` (and `value`, for operations taking one), both in
/// presented form. Returns the operation's presented result.
pub fn execute<S, A>(
    plan: &BranchPlan,
    mut access: A,
    key: &Datum,
    value: Option<&Datum>,
) -> Result<Datum, ExecError>
where
    S: BuildHasher,
    A: SlotAccess<S>,
{
    let store = access.slots();
    let key_strategy = store.key_strategy();
    let null_checked = matches!(plan.key_steps.first(), Some(KeyStep::NullCheck(_)));
    let stored_key = match (key.is_null(), null_checked) {
        (true, true) => Datum::null(),
        (true, false) => return Err(ExecError::NullKey),
        (false, _) => key_strategy.unwrap(key)?,
    };
    let stored_value = match (value, store.value_domain()) {
        (Some(v), Some(d)) => Some(d.strategy().unwrap(v)?),
        _ => None,
    };
    let mut frame = Frame {
        key: stored_key,
        value: stored_value,
        locals: HashMap::new(),
        plan,
    };

    let mut route = Route::Probe;
    for step in &plan.key_steps {
        match step {
            KeyStep::NullCheck(path) if frame.key.is_null() => match path {
                NullPath::DedicatedSlot => route = Route::NullSlot,
                NullPath::Absent => route = Route::Absent,
                NullPath::Reject => return Err(ExecError::NullKey),
            },
            KeyStep::NullCheck(_) => {}
            KeyStep::NormalizeFloat => frame.key = key_strategy.normalize(frame.key.clone()),
            KeyStep::CheckMarkers => {
                if access.slots().is_marker(&frame.key) {
                    route = Route::Absent;
                }
            }
            KeyStep::RebindMarkers => {
                if access.slots().is_marker(&frame.key) {
                    access.slots_mut()?.rebind_for(&frame.key)?;
                }
            }
        }
    }

    match &plan.decision {
        Decision::Split { probe, .. } | Decision::Guard { probe, .. } => {
            let branch = locate(&mut access, &mut frame, *probe, route)?;
            if let Some(ret) = run(&mut access, &mut frame, &plan.lifted)? {
                return Ok(ret);
            }
            if let Decision::Guard { branch: guarded, .. } = plan.decision {
                if branch != guarded {
                    return Ok(fallthrough(access.slots()));
                }
            }
            run_segment(&mut access, &mut frame, branch)
        }
        Decision::Scan(scan) => {
            if let Some(ret) = run(&mut access, &mut frame, &plan.lifted)? {
                return Ok(ret);
            }
            let branch = match route {
                Route::Probe => {
                    let outcome = access.slots().scan(&frame.key)?;
                    let slot = match outcome {
                        ScanOutcome::Present { index } => index,
                        ScanOutcome::Absent {
                            free,
                            first_tombstone,
                        } if scan.track_first_tombstone => first_tombstone.unwrap_or(free),
                        ScanOutcome::Absent { free, .. } => free,
                    };
                    frame.locals.insert(Local::Index, Bound::Slot(SlotIndex::Table(slot)));
                    if outcome.is_present() {
                        Branch::Present
                    } else {
                        Branch::Absent
                    }
                }
                Route::NullSlot => {
                    frame.locals.insert(Local::Index, Bound::Slot(SlotIndex::Null));
                    if access.slots().null_occupied() {
                        Branch::Present
                    } else {
                        Branch::Absent
                    }
                }
                Route::Absent => Branch::Absent,
            };
            match scan.exit(branch) {
                Exit::Inline => run_segment(&mut access, &mut frame, branch),
                Exit::Jump(id) => {
                    let seg = plan
                        .block(id)
                        .ok_or(ExecError::Malformed("jump to an unknown block"))?;
                    Ok(run(&mut access, &mut frame, &seg.stmts)?
                        .unwrap_or_else(|| fallthrough(access.slots())))
                }
                Exit::Fallthrough => Ok(fallthrough(access.slots())),
            }
        }
    }
}

/// Runs the probe primitive and binds the index locals.
fn locate<S: BuildHasher, A: SlotAccess<S>>(
    access: &mut A,
    frame: &mut Frame<'_>,
    probe: ProbeCall,
    route: Route,
) -> Result<Branch, ExecError> {
    let (branch, slot) = match route {
        Route::Absent => return Ok(Branch::Absent),
        Route::NullSlot => {
            let present = access.slots().null_occupied();
            if !present && probe == ProbeCall::Insert {
                access
                    .slots_mut()?
                    .insert_at(SlotIndex::Null, Datum::null(), frame.value.clone())?;
            }
            (if present { Branch::Present } else { Branch::Absent }, SlotIndex::Null)
        }
        Route::Probe => match access.slots().scan(&frame.key)? {
            ScanOutcome::Present { index } => (Branch::Present, SlotIndex::Table(index)),
            absent => {
                let slot = absent
                    .insertion_slot()
                    .ok_or(ExecError::Malformed("absent scan without insertion slot"))?;
                if probe == ProbeCall::Insert {
                    access
                        .slots_mut()?
                        .insert_at(SlotIndex::Table(slot), frame.key.clone(), frame.value.clone())?;
                }
                (Branch::Absent, SlotIndex::Table(slot))
            }
        },
    };
    frame.locals.insert(Local::Index, Bound::Slot(slot));
    if probe == ProbeCall::InsertionIndex {
        frame.locals.insert(Local::Insertion, Bound::Slot(slot));
    }
    Ok(branch)
}

fn run_segment<S: BuildHasher, A: SlotAccess<S>>(
    access: &mut A,
    frame: &mut Frame<'_>,
    branch: Branch,
) -> Result<Datum, ExecError> {
    let plan = frame.plan;
    let ret = run(access, frame, &plan.segment(branch).stmts)?;
    Ok(ret.unwrap_or_else(|| fallthrough(access.slots())))
}

/// Result of an operation that ends without a return.
fn fallthrough<S>(store: &SlotStore<S>) -> Datum
where
    S: BuildHasher,
{
    store.default_value()
}

/// Executes statements until a return; `None` if none was reached.
fn run<S: BuildHasher, A: SlotAccess<S>>(
    access: &mut A,
    frame: &mut Frame<'_>,
    stmts: &[Stmt],
) -> Result<Option<Datum>, ExecError> {
    for stmt in stmts {
        match stmt {
            Stmt::Let(l, e) => {
                let v = eval(access, frame, e)?;
                frame.locals.insert(*l, v);
            }
            Stmt::StoreValue { array, value } => {
                frame.array(*array)?;
                let v = datum(eval(access, frame, value)?)?;
                let slot = frame.slot()?;
                access.slots_mut()?.set_value(slot, v)?;
            }
            Stmt::InsertAt { key, value } => {
                let k = datum(eval(access, frame, key)?)?;
                let v = match value {
                    Some((array, e)) => {
                        frame.array(*array)?;
                        Some(datum(eval(access, frame, e)?)?)
                    }
                    None => None,
                };
                let slot = frame.slot()?;
                access.slots_mut()?.insert_at(slot, k, v)?;
            }
            Stmt::RemoveAt { clear_value } => {
                if let Some(array) = clear_value {
                    frame.array(*array)?;
                }
                let slot = frame.slot()?;
                access.slots_mut()?.remove_at(slot, clear_value.is_some())?;
            }
            Stmt::Return(e) => return Ok(Some(datum(eval(access, frame, e)?)?)),
        }
    }
    Ok(None)
}

fn datum(b: Bound) -> Result<Datum, ExecError> {
    match b {
        Bound::Datum(d) => Ok(d),
        _ => Err(ExecError::Malformed("expected a datum")),
    }
}

fn eval<S: BuildHasher, A: SlotAccess<S>>(
    access: &A,
    frame: &Frame<'_>,
    e: &Expr,
) -> Result<Bound, ExecError> {
    let store = access.slots();
    Ok(match e {
        Expr::Key => Bound::Datum(frame.key.clone()),
        Expr::ValueArg => Bound::Datum(
            frame
                .value
                .clone()
                .ok_or(ExecError::Malformed("operation takes no value argument"))?,
        ),
        Expr::Local(l) => frame.local(*l)?.clone(),
        Expr::Array(a) => {
            frame.array(*a)?;
            Bound::Array
        }
        Expr::CurrentValue(a) => {
            frame.array(*a)?;
            Bound::Datum(store.value_at(frame.slot()?)?)
        }
        Expr::InsertionSlot => frame.local(Local::Insertion)?.clone(),
        Expr::Wrap(inner) => {
            let stored = datum(eval(access, frame, inner)?)?;
            let domain = store
                .value_domain()
                .ok_or(ExecError::Malformed("key sets have no values to wrap"))?;
            Bound::Datum(domain.strategy().wrap(&stored)?)
        }
        Expr::ValueEquals(inner) => {
            let stored = datum(eval(access, frame, inner)?)?;
            let arg = frame
                .value
                .as_ref()
                .ok_or(ExecError::Malformed("operation takes no value argument"))?;
            let domain = store
                .value_domain()
                .ok_or(ExecError::Malformed("key sets have no values to compare"))?;
            Bound::Datum(Datum::Bool(domain.strategy().equals(&stored, arg)))
        }
        Expr::Default => Bound::Datum(store.default_value()),
        Expr::Bool(b) => Bound::Datum(Datum::Bool(*b)),
        Expr::Const(c) => Bound::Datum(Datum::Int(*c)),
    })
}

//! sentinel-probe: specializes the operations of open-addressing hash
//! tables that mark free and removed slots with reserved key values instead
//! of per-slot metadata.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: decide, per (operation, key/value representation), how the
//!   probe and the present/absent branches of one table operation are laid
//!   out, and hand the result back as a structured plan.
//! - Layers:
//!   - `probe`: deterministic, total probe sequences and the
//!     tombstone-aware scan.
//!   - `sentinel`: free/removed markers of integral and floating keys and
//!     the rebinding protocol when a real key collides with a marker.
//!   - `analyzer`: dry run of the present/absent bodies, keeping counts.
//!   - `specializer`: layout, common-prefix hoisting, capture of reused
//!     storage reads, key handling per domain, permission resolution.
//!   - `exec`, `store`, `table`: a runtime table whose operations run the
//!     produced plans.
//!
//! Plans
//! - A plan is a statement tree (`ir`), compared structurally. Hoisting and
//!   materialization rewrite trees; nothing is spliced as text.
//! - One decision point splits present from absent; with one branch empty
//!   the other runs behind a guard.
//! - Inline plans expand the probe loop and reach multi-statement branches
//!   through labelled blocks.
//!
//! Constraints
//! - Specialization is pure per call; separate calls share nothing.
//! - Tables are single-writer and `!Sync`. Resize happens inside the
//!   inserting call. A debug-only guard catches nested operations on one
//!   table.
//! - A free slot always exists: the store grows before the array fills.
//!
//! Representation
//! - Numeric keys are stored as bit patterns; float keys are normalized so
//!   every NaN is one key and `+0.0`/`-0.0` are two.
//! - Reference keys use null as the free marker and a per-table singleton,
//!   compared by identity, as the removed marker. A permitted null key lives
//!   in a dedicated slot outside the probe sequence.
//!
//! Notes and non-goals
//! - No printer: turning a plan into source text is left to callers.
//! - No persistence or serialization of table contents.
//! - No internal synchronization.

pub mod access;
pub mod analyzer;
pub mod bodies;
pub mod domain;
pub mod exec;
pub mod ir;
mod plan_proptest;
pub mod probe;
pub mod sentinel;
pub mod specializer;
pub mod store;
pub mod table;

// Public surface
pub use access::ExclusiveAccess;
pub use analyzer::{
    BodyBuilder, BodyContext, BodySource, BranchCostAnalyzer, BranchMetrics, Measurements,
};
pub use domain::{Datum, Domain, DomainError, FloatWidth, KeyDomain, ValueDomain, Width};
pub use exec::{execute, ExecError};
pub use ir::{
    Branch, BranchPlan, Decision, Exit, KeyStep, OperationKind, Permission, PermissionSet, Segment,
    Stmt,
};
pub use probe::{ProbeError, ProbeSequenceEngine, ProbeStrategy, ScanOutcome};
pub use sentinel::{SentinelAllocator, SentinelError, SentinelState};
pub use specializer::{
    specialize, Mutability, OperationDescriptor, OperationSpecializer, SpecializeError,
    SpecializedOp, SpecializerConfig, TableShape,
};
pub use store::SlotIndex;
pub use table::{QueryOp, SentinelTable, TableConfig, TableError, TableStats};

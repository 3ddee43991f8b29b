//! Guard against overlapping operations on one table.
//!
//! A `SentinelTable` is neither `Send` nor `Sync`, so the only way two of its
//! operations can overlap is a callback out of a running operation (a hasher
//! or a value destructor) re-entering the same table. Debug builds record the
//! operation kind that holds the table and report both kinds on overlap.
//! Release builds keep no state.

use crate::ir::OperationKind;
use core::cell::Cell;
use core::marker::PhantomData;

/// Tracks which operation, if any, is running on a table.
#[derive(Debug)]
pub struct ExclusiveAccess {
    #[cfg(debug_assertions)]
    holder: Cell<Option<OperationKind>>,
    _not_send: PhantomData<*mut ()>,
}

impl ExclusiveAccess {
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            holder: Cell::new(None),
            _not_send: PhantomData,
        }
    }

    /// Claims the table for `kind` until the returned guard drops.
    ///
    /// # Panics
    /// In debug builds, when another operation still holds the table.
    #[inline]
    pub fn enter(&self, kind: OperationKind) -> AccessGuard<'_> {
        #[cfg(debug_assertions)]
        {
            if let Some(held) = self.holder.get() {
                panic!("table operation {kind:?} started while {held:?} is still in flight");
            }
            self.holder.set(Some(kind));
            AccessGuard { owner: self, kind }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = kind;
            AccessGuard {
                _owner: PhantomData,
            }
        }
    }

    /// Operation currently holding the table. Always `None` in release builds.
    pub fn holder(&self) -> Option<OperationKind> {
        #[cfg(debug_assertions)]
        {
            self.holder.get()
        }

        #[cfg(not(debug_assertions))]
        {
            None
        }
    }
}

impl Default for ExclusiveAccess {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one table operation.
pub struct AccessGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a ExclusiveAccess,
    #[cfg(debug_assertions)]
    kind: OperationKind,
    #[cfg(not(debug_assertions))]
    _owner: PhantomData<&'a ()>,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(self.owner.holder.get(), Some(self.kind));
            self.owner.holder.set(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_is_cleared_when_the_guard_drops() {
        let access = ExclusiveAccess::new();
        let guard = access.enter(OperationKind::Insert);
        #[cfg(debug_assertions)]
        assert_eq!(access.holder(), Some(OperationKind::Insert));
        drop(guard);
        assert_eq!(access.holder(), None);
        let _next = access.enter(OperationKind::Lookup);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Lookup started while Remove")]
    fn overlap_names_both_operations() {
        let access = ExclusiveAccess::new();
        let _remove = access.enter(OperationKind::Remove);
        let _lookup = access.enter(OperationKind::Lookup);
    }
}

//! Present/absent bodies of the built-in operations.
//!
//! | kind          | present                                  | absent                     |
//! |---------------|------------------------------------------|----------------------------|
//! | Lookup        | wrapped current value (`true` for sets)  | default (`false`)          |
//! | Insert        | swap in the new value, return the old one| insert, return default     |
//! | CustomInsert  | current value, untouched                 | insert, return default     |
//! | Remove        | tombstone, return the old value          | default (`false`)          |
//! | ReplaceValue  | swap in the new value, return the old one| default                    |
//!
//! When the probe loop is not expanded inline, `Insert` goes through the
//! `insert(key, value)` primitive, which already stored an absent key, and
//! `CustomInsert` reads its slot from the `insertionIndex(key)` primitive.
//!
//! Query-update operations that reuse a built-in probe kind with their own
//! bodies: [`MembershipBody`] and [`ContainsEntryBody`] over `Lookup`,
//! [`JustPutBody`] over `Insert`.

use crate::analyzer::{BodyBuilder, BodySource};
use crate::ir::{Expr, Local, OperationKind, Stmt};

/// Bodies selected by the operation kind of the builder's context.
#[derive(Copy, Clone, Debug, Default)]
pub struct BuiltinBody;

impl BuiltinBody {
    fn index_capture(b: &mut BodyBuilder<'_>) {
        let ctx = b.context();
        if ctx.kind == OperationKind::CustomInsert && !ctx.inline {
            b.push(Stmt::Let(Local::Index, Expr::InsertionSlot));
        }
    }
}

impl BodySource for BuiltinBody {
    fn present(&self, b: &mut BodyBuilder<'_>) {
        Self::index_capture(b);
        let map = b.context().is_map();
        match b.context().kind {
            OperationKind::Lookup => {
                if map {
                    let v = b.current_value();
                    b.ret(Expr::wrap(v));
                } else {
                    b.ret(Expr::Bool(true));
                }
            }
            OperationKind::Insert | OperationKind::ReplaceValue if map => {
                b.capture_prev()
                    .store_value(Expr::ValueArg)
                    .ret(Expr::wrap(Expr::Local(Local::Prev)));
            }
            OperationKind::Insert | OperationKind::ReplaceValue => {
                b.ret(Expr::Bool(false));
            }
            OperationKind::CustomInsert => {
                if map {
                    let v = b.current_value();
                    b.ret(Expr::wrap(v));
                } else {
                    b.ret(Expr::Bool(false));
                }
            }
            OperationKind::Remove => {
                if map {
                    b.capture_prev()
                        .remove_key()
                        .ret(Expr::wrap(Expr::Local(Local::Prev)));
                } else {
                    b.remove_key().ret(Expr::Bool(true));
                }
            }
        }
    }

    fn absent(&self, b: &mut BodyBuilder<'_>) {
        Self::index_capture(b);
        let ctx = b.context();
        let map = ctx.is_map();
        let stores = match ctx.kind {
            OperationKind::Insert => ctx.inline,
            OperationKind::CustomInsert => true,
            _ => false,
        };
        let inserting = ctx.kind.inserts();
        if stores {
            b.insert_key();
        }
        if map {
            b.ret(Expr::Default);
        } else {
            b.ret(Expr::Bool(inserting));
        }
    }
}

/// Membership test over a map: `true` when present, `false` otherwise.
#[derive(Copy, Clone, Debug, Default)]
pub struct MembershipBody;

impl BodySource for MembershipBody {
    fn present(&self, b: &mut BodyBuilder<'_>) {
        b.ret(Expr::Bool(true));
    }

    fn absent(&self, b: &mut BodyBuilder<'_>) {
        b.ret(Expr::Bool(false));
    }
}

/// Entry test over a map: present and holding the value argument.
#[derive(Copy, Clone, Debug, Default)]
pub struct ContainsEntryBody;

impl BodySource for ContainsEntryBody {
    fn present(&self, b: &mut BodyBuilder<'_>) {
        let v = b.current_value();
        b.ret(Expr::value_equals(v));
    }

    fn absent(&self, b: &mut BodyBuilder<'_>) {
        b.ret(Expr::Bool(false));
    }
}

/// Put that does not report the previous value.
///
/// Out of line the `insert` primitive stores an absent key, which leaves the
/// absent body empty. Key sets have nothing to do once the key is present.
#[derive(Copy, Clone, Debug, Default)]
pub struct JustPutBody;

impl BodySource for JustPutBody {
    fn present(&self, b: &mut BodyBuilder<'_>) {
        if b.context().is_map() {
            b.store_value(Expr::ValueArg);
        }
    }

    fn absent(&self, b: &mut BodyBuilder<'_>) {
        if b.context().inline {
            b.insert_key();
        }
    }
}

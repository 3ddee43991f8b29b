// Access tracking as seen from table operations: every operation claims the
// table for its own kind and gives it back, including when it fails.
use sentinel_probe::{
    Datum, Domain, ExclusiveAccess, Mutability, OperationKind, SentinelTable, TableError,
    TableShape, Width,
};

#[test]
fn every_kind_can_claim_the_table_in_turn() {
    let access = ExclusiveAccess::default();
    for kind in OperationKind::ALL {
        let _g = access.enter(kind);
        #[cfg(debug_assertions)]
        assert_eq!(access.holder(), Some(kind));
    }
    assert_eq!(access.holder(), None);
}

#[cfg(debug_assertions)]
#[test]
fn overlapping_operations_panic_in_debug() {
    let access = ExclusiveAccess::new();
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _insert = access.enter(OperationKind::Insert);
        let _lookup = access.enter(OperationKind::Lookup);
    }));
    let msg = res.expect_err("overlap is reported");
    let msg = msg.downcast_ref::<String>().cloned().unwrap_or_default();
    assert!(msg.contains("Lookup") && msg.contains("Insert"), "{msg}");
    // The outer guard unwound too.
    assert_eq!(access.holder(), None);
}

#[cfg(debug_assertions)]
#[test]
fn unwinding_operation_releases_the_table() {
    let access = ExclusiveAccess::new();
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _g = access.enter(OperationKind::Remove);
        panic!("hasher failed mid-probe");
    }));
    assert_eq!(access.holder(), None);
    let _g = access.enter(OperationKind::Lookup);
}

#[test]
fn failed_operations_release_the_table() {
    let shape = TableShape::map(
        Domain::int(Width::W8, false),
        Domain::int(Width::W8, false),
        Mutability::Updatable,
    );
    let mut t = SentinelTable::new(shape).unwrap();
    assert!(matches!(
        t.insert(Datum::Int(300), Datum::Int(1)),
        Err(TableError::Exec(_))
    ));
    assert_eq!(
        t.remove(&Datum::Int(1)),
        Err(TableError::Unsupported(OperationKind::Remove))
    );
    // Each of these would panic in debug builds if an earlier failure had
    // left the table claimed.
    assert_eq!(t.insert(Datum::Int(1), Datum::Int(2)).unwrap(), Datum::Int(0));
    assert_eq!(t.get(&Datum::Int(1)).unwrap(), Datum::Int(2));
}

#[cfg(not(debug_assertions))]
#[test]
fn release_builds_keep_no_holder() {
    let access = ExclusiveAccess::new();
    let _insert = access.enter(OperationKind::Insert);
    let _lookup = access.enter(OperationKind::Lookup);
    assert_eq!(access.holder(), None);
}

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sentinel_probe::{
    specialize, Branch, Domain, Mutability, OperationDescriptor, OperationKind, TableShape, Width,
};
use std::time::Duration;

fn shapes() -> Vec<TableShape> {
    let keys = [
        Domain::int(Width::W32, true),
        Domain::float64(),
        Domain::reference(true),
    ];
    let values = [None, Some(Domain::int(Width::W64, true)), Some(Domain::reference(true))];
    keys.iter()
        .flat_map(|k| {
            values.iter().map(move |v| TableShape {
                key: *k,
                value: *v,
                mutability: Mutability::Mutable,
            })
        })
        .collect()
}

fn bench_specialize_one(c: &mut Criterion) {
    let shape = TableShape::map(
        Domain::int(Width::W32, true),
        Domain::reference(true),
        Mutability::Mutable,
    );
    for inline in [false, true] {
        c.bench_function(&format!("specialize::remove/inline={inline}"), |b| {
            let desc = OperationDescriptor::new(OperationKind::Remove).inline(inline);
            b.iter(|| black_box(specialize(black_box(desc), shape).unwrap()))
        });
    }
}

fn bench_specialize_surface(c: &mut Criterion) {
    let shapes = shapes();
    c.bench_function("specialize::all_kinds_all_shapes", |b| {
        b.iter(|| {
            let mut n = 0usize;
            for shape in &shapes {
                for kind in OperationKind::ALL {
                    for branch in [Branch::Present, Branch::Absent] {
                        let desc = OperationDescriptor::new(kind)
                            .inline(true)
                            .most_probable(branch);
                        if let Ok(op) = specialize(desc, *shape) {
                            n += op.plan.lifted.len() + op.plan.blocks.len();
                        }
                    }
                }
            }
            black_box(n)
        })
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(20)
        .measurement_time(Duration::from_secs(3))
        .warm_up_time(Duration::from_secs(1))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_specialize_one, bench_specialize_surface
}
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, Criterion};
use seu_injector::targets::{Catalog, InjectionSelector};
use std::path::Path;

fn criterion_benchmark(c: &mut Criterion) {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("targets");
    // Simics overlay keeps the TLB and cache targets, the largest tables
    let catalog = Catalog::load(&dir, "p2020", "simics").unwrap();
    let restricted = catalog
        .restrict(Some(&["GPR".to_string(), "SPR".to_string()]), None)
        .unwrap();
    let mut selector = InjectionSelector::seeded(0);

    let mut group = c.benchmark_group("injection_selection");
    group.warm_up_time(std::time::Duration::from_secs(1));
    group.measurement_time(std::time::Duration::from_secs(5));
    group.bench_function("full catalog", |b| {
        b.iter(|| selector.choose(&catalog).unwrap());
    });
    group.bench_function("restricted catalog", |b| {
        b.iter(|| selector.choose(&restricted).unwrap());
    });
    group.bench_function("locate", |b| {
        b.iter(|| {
            let site = selector.choose(&catalog).unwrap();
            catalog.locate(&site).unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

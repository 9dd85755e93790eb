//! Microbenchmarks for the packed name-value arena: handle registration and
//! the set/get path a `LogMessage` drives on every parsed field.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use logcore::nvtable::{NVRegistry, NVTable};

fn bench_get_or_assign_handle(c: &mut Criterion) {
    let registry = NVRegistry::new(&["HOST", "MESSAGE", "PROGRAM"]);
    c.bench_function("nvregistry_get_or_assign_existing", |b| {
        b.iter(|| registry.get_or_assign_handle(black_box(b"HOST")).unwrap())
    });
    c.bench_function("nvregistry_get_or_assign_new", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let name = format!("DYN_FIELD_{i}");
            registry.get_or_assign_handle(black_box(name.as_bytes())).unwrap()
        })
    });
}

fn bench_set_and_get_value(c: &mut Criterion) {
    let registry = NVRegistry::new(&["HOST", "MESSAGE", "PROGRAM"]);
    let host = registry.get_or_assign_handle(b"HOST").unwrap();
    let message = registry.get_or_assign_handle(b"MESSAGE").unwrap();

    let mut group = c.benchmark_group("nvtable_set_value");
    for value_len in [8usize, 64, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(value_len), &value_len, |b, &len| {
            let value = vec![b'x'; len];
            b.iter(|| {
                let mut table = NVTable::new(registry.num_static_entries() as usize, 256, 1 << 20);
                table.set_value(host, b"HOST", black_box(&value)).unwrap();
                table.set_value(message, b"MESSAGE", black_box(&value)).unwrap();
                black_box(table.get(message).len())
            })
        });
    }
    group.finish();
}

fn bench_clone_with_headroom(c: &mut Criterion) {
    let registry = NVRegistry::new(&["HOST", "MESSAGE", "PROGRAM"]);
    let host = registry.get_or_assign_handle(b"HOST").unwrap();
    let message = registry.get_or_assign_handle(b"MESSAGE").unwrap();
    let mut table = NVTable::new(registry.num_static_entries() as usize, 256, 1 << 20);
    table.set_value(host, b"HOST", b"example.org").unwrap();
    table.set_value(message, b"MESSAGE", b"something happened over here").unwrap();

    c.bench_function("nvtable_clone_with_headroom", |b| {
        b.iter(|| black_box(table.clone_with_headroom(128)))
    });
}

criterion_group!(benches, bench_get_or_assign_handle, bench_set_and_get_value, bench_clone_with_headroom);
criterion_main!(benches);

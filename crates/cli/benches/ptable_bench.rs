use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use memtable::{IndexEntry, MemTable};
use ptable::{PTable, TableOptions, CURRENT_VERSION};
use std::hint::black_box;
use tempfile::tempdir;

const N_STREAMS: u64 = 1_000;
const EVENTS_PER_STREAM: i64 = 100;

fn build_memtable() -> MemTable {
    let mut mem = MemTable::new((N_STREAMS as usize) * (EVENTS_PER_STREAM as usize));
    let mut pos = 0;
    for h in 0..N_STREAMS {
        for n in 0..EVENTS_PER_STREAM {
            mem.add(IndexEntry::new(h.wrapping_mul(0x9E37_79B9_7F4A_7C15), n, pos));
            pos += 1;
        }
    }
    mem
}

fn ptable_write_benchmark(c: &mut Criterion) {
    c.bench_function("ptable_write_from_memtable_100k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("bench.ptable");
                (dir, path, build_memtable())
            },
            |(_dir, path, mem)| {
                PTable::from_memtable(&mem, &path, CURRENT_VERSION, &TableOptions::default())
                    .unwrap();
            },
            BatchSize::LargeInput,
        );
    });
}

fn ptable_lookup_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.ptable");
    let table =
        PTable::from_memtable(&build_memtable(), &path, CURRENT_VERSION, &TableOptions::default())
            .unwrap();
    let hash = 500u64.wrapping_mul(0x9E37_79B9_7F4A_7C15);

    c.bench_function("ptable_lookup_one_hit", |b| {
        b.iter(|| black_box(table.lookup_one(hash, 42).unwrap()))
    });
    c.bench_function("ptable_lookup_one_miss", |b| {
        b.iter(|| black_box(table.lookup_one(hash ^ 1, 42).unwrap()))
    });
    c.bench_function("ptable_lookup_range_20", |b| {
        b.iter(|| black_box(table.lookup_range(hash, 40, 59).unwrap().to_vec().unwrap()))
    });
}

criterion_group!(benches, ptable_write_benchmark, ptable_lookup_benchmark);
criterion_main!(benches);

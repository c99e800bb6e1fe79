use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use crackhash_core::{
    keyspace::Keyspace,
    types::{Alphabet, RequestId, Task},
};
use crackhash_worker::engine::ComputeEngine;

/// A digest no candidate matches, so every bench scans its whole partition.
const UNREACHABLE: &str = "ffffffffffffffffffffffffffffffff";

fn task(max_length: u32, part_count: u32) -> Task {
    Task {
        request_id: RequestId::new(),
        part_number: 0,
        part_count,
        hash: UNREACHABLE.to_owned(),
        max_length,
        alphabet: Alphabet::default(),
    }
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.sample_size(10);

    for threads in [1, num_cpus::get()] {
        let engine = ComputeEngine::new(threads).unwrap();
        for (max_length, part_count) in [(3, 1), (4, 4)] {
            let task = task(max_length, part_count);
            let keyspace = Keyspace::new(&task.alphabet, max_length).unwrap();
            let range = keyspace.partition(0, part_count);
            group.throughput(Throughput::Elements((range.end - range.start) as u64));
            group.bench_function(
                format!("threads/{threads}/len/{max_length}/parts/{part_count}"),
                |b| b.iter(|| black_box(engine.process(black_box(&task)).unwrap())),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);

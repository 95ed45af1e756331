//! Performance benchmarks for shardcast-files.
//!
//! Run with: `cargo bench -p shardcast-files`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::RngCore;
use shardcast_crypto::{Cypher, TransferKey};
use shardcast_files::{PartMessage, Partitioner};

const MAX_PAYLOAD: usize = 1024;

fn random_file(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    let partitioner = Partitioner::new(PartMessage::part_size(MAX_PAYLOAD).unwrap()).unwrap();

    for size in [4_000usize, 64_000, 250_000] {
        let file = random_file(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("bytes", size), &file, |b, file| {
            b.iter(|| black_box(partitioner.partition(file)));
        });
    }

    group.finish();
}

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");
    let partitioner = Partitioner::new(PartMessage::part_size(MAX_PAYLOAD).unwrap()).unwrap();

    for size in [4_000usize, 64_000, 250_000] {
        let parts = partitioner.partition(&random_file(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("bytes", size), &parts, |b, parts| {
            b.iter(|| black_box(partitioner.join(parts, size)));
        });
    }

    group.finish();
}

/// Frame and encrypt every part of a maximum-size file, as the sending
/// workers do.
fn bench_encrypt_parts(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt_parts");
    let partitioner = Partitioner::new(PartMessage::part_size(MAX_PAYLOAD).unwrap()).unwrap();
    let key = TransferKey::from_bytes([0x5A; 32]);
    let parts = partitioner.partition(&random_file(250_000));

    group.throughput(Throughput::Bytes(250_000));
    group.bench_function("250kB", |b| {
        b.iter(|| {
            for (i, part) in parts.iter().enumerate() {
                let message = PartMessage::encode(i as u16, part, MAX_PAYLOAD).unwrap();
                black_box(Cypher::new(&key, i as u16).encrypt(&message).unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(partition_benches, bench_partition, bench_join);
criterion_group!(crypto_benches, bench_encrypt_parts);
criterion_main!(partition_benches, crypto_benches);

//! Batching benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rpcq_core::{Batcher, Transport};
use rpcq_protocol::Channel;
use rpcq_runtime::{BatchingTransport, MemoryNetwork, RawTransport};

const MESSAGES: usize = 256;

fn bench_batcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("batcher_queue_and_flush");

    for size in [32, 512] {
        let message = vec![0x42; size];

        group.throughput(Throughput::Bytes((size * MESSAGES) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            let mut batcher = Batcher::new();
            b.iter(|| {
                let mut sent = 0usize;
                for i in 0..MESSAGES {
                    batcher.queue_item((i % 8) as u64, Channel::ReliableRpc, message);
                    batcher.send_if_over_threshold(512, |_, _, batch| sent += batch.len());
                }
                batcher.send_all(|_, _, batch| sent += batch.len());
                black_box(sent)
            });
        });
    }

    group.finish();
}

fn bench_receive_items(c: &mut Criterion) {
    let mut group = c.benchmark_group("batcher_receive_items");

    let mut batcher = Batcher::new();
    for _ in 0..MESSAGES {
        batcher.queue_item(1, Channel::ReliableRpc, &[0x42; 64]);
    }
    let mut batch = Bytes::new();
    batcher.send_all(|_, _, bytes| batch = Bytes::copy_from_slice(bytes));

    group.throughput(Throughput::Elements(MESSAGES as u64));
    group.bench_function("64", |b| {
        b.iter(|| black_box(Batcher::receive_items(&batch).unwrap().len()));
    });

    group.finish();
}

fn bench_adapter_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("adapter_flush");

    for channel in [Channel::ReliableRpc, Channel::PositionUpdate] {
        let network = MemoryNetwork::new();
        let mut sink = network.join(2);
        let mut transport = BatchingTransport::new(network.join(1), 64 * 1024, 256 * 1024);
        let payload = [0x42u8; 100];

        group.throughput(Throughput::Elements(MESSAGES as u64));
        group.bench_function(BenchmarkId::from_parameter(channel), |b| {
            b.iter(|| {
                for _ in 0..MESSAGES {
                    transport.send(2, &payload, channel);
                }
                transport.flush();
                while sink.poll_raw().is_some() {}
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_batcher, bench_receive_items, bench_adapter_flush);
criterion_main!(benches);

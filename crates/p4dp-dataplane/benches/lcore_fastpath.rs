//! Lcore Fast Path Benchmarks
//!
//! Replica lookups, egress batching and a full forwarding burst.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use p4dp_common::{LcoreParams, MAX_PKT_BURST};
use p4dp_dataplane::{
    Action, AsyncMode, DataplaneConfig, EgressBuffers, ExactMatchContents, ExactMatchTable,
    LcoreRuntime, LocalTables, Mbuf, MbufPool, MemoryIo, ReplicaTableManager,
};
use std::sync::Arc;

type Table = ExactMatchTable<u16>;

fn contents(n: u32) -> ExactMatchContents<u16> {
    (0..n).fold(ExactMatchContents::new(4), |c, i| {
        c.with_entry(i.to_be_bytes(), (i % 4) as u16)
    })
}

fn bench_replica_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("replica_lookup");

    for size in [1_000u32, 100_000] {
        let tables = ReplicaTableManager::<Table>::new(1, 1);
        tables.seed(0, 0, contents(size)).unwrap();
        let key = (size / 2).to_be_bytes();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| tables.lookup(black_box(0), 0, black_box(&key)))
        });
    }
    group.finish();
}

fn bench_egress_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("egress");
    group.throughput(Throughput::Elements(MAX_PKT_BURST as u64));

    let pool = MbufPool::new(1024);
    let mut egress = EgressBuffers::new(vec![0; 4]);
    let mut io = MemoryIo::with_tx_limit(0);

    group.bench_function("append_burst", |b| {
        b.iter(|| {
            for i in 0..MAX_PKT_BURST {
                let pkt = pool.alloc_with(0, &[i as u8; 64]).unwrap();
                let _ = egress.append((i % 4) as u16, pkt, &mut io);
            }
            egress.flush_all(&mut io)
        })
    });
    group.finish();
}

fn route(pkt: &mut Mbuf, tables: &LocalTables<'_, Table>) -> Action {
    match tables.lookup(0, &pkt.data()[..4]) {
        Some(port) => Action::forward(port),
        None => Action::drop_packet(),
    }
}

fn bench_run_burst(c: &mut Criterion) {
    let config = DataplaneConfig {
        lcore_params: vec![LcoreParams::new(0, 0, 0)],
        nb_ports: 4,
        async_mode: AsyncMode::Off,
        mbuf_pool_size: 1024,
        ..Default::default()
    };
    let tables = Arc::new(ReplicaTableManager::<Table>::new(1, 1));
    tables.seed(0, 0, contents(1024)).unwrap();
    let mut runtime = LcoreRuntime::new(0, &config, tables).unwrap();

    let mut group = c.benchmark_group("lcore");
    group.throughput(Throughput::Elements(MAX_PKT_BURST as u64));
    group.bench_function("run_burst", |b| {
        b.iter_batched(
            || {
                let mut io = MemoryIo::with_tx_limit(0);
                for i in 0..MAX_PKT_BURST as u32 {
                    io.inject(0, 0, i.to_be_bytes().repeat(16));
                }
                io
            },
            |mut io| runtime.run_burst(&mut io, &mut route),
            criterion::BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_replica_lookup, bench_egress_batching, bench_run_burst);
criterion_main!(benches);

//! Throughput of the enqueue path under the flush pipeline's `Mutex` +
//! `Condvar`, and of NDJSON serialization for a transaction with a
//! moderately deep span tree — the two hot paths application threads
//! actually pay for per request.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use terra_apm_agent::config::Config;
use terra_apm_agent::flush::FlushPipeline;
use terra_apm_agent::metadata::Metadata;
use terra_apm_agent::model::{Outcome, Transaction};
use terra_apm_agent::serializer;

fn transaction_with_spans(depth: usize) -> Transaction {
    let mut txn = Transaction::begin("GET /x", "request", None, None);
    for i in 0..depth {
        txn.begin_span(&format!("span-{i}"), "code", None);
    }
    for _ in 0..depth {
        txn.end_span(Outcome::Success);
    }
    txn.end(Outcome::Success, Some("200".to_string()));
    txn
}

fn bench_enqueue(c: &mut Criterion) {
    let config = Arc::new(Config::default());
    let metadata = Arc::new(Metadata::build(&config));
    let pipeline = FlushPipeline::start(config, metadata);

    c.bench_function("flush_pipeline_enqueue", |b| {
        b.iter(|| {
            let txn = Transaction::begin("t", "request", None, None);
            pipeline.enqueue(txn);
        })
    });

    pipeline.shutdown();
}

fn bench_serialize(c: &mut Criterion) {
    let config = Config::default();
    let metadata = Metadata::build(&config);

    let mut group = c.benchmark_group("serialize_transaction");
    for depth in [0usize, 4, 16] {
        let txn = transaction_with_spans(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &txn, |b, txn| {
            b.iter(|| serializer::serialize_transaction(&metadata, txn))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_serialize);
criterion_main!(benches);

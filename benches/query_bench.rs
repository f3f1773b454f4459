//! Criterion benchmarks for query parsing and row streaming.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tabq::engine::{Engine, PassType};
use tabq::query::parse_query;

fn synthetic_orders_xml(rows: usize) -> String {
    let mut s = String::with_capacity(rows * 96);
    s.push_str("<orders>");
    for i in 0..rows {
        s.push_str(&format!(
            "<order><id>{}</id><customer>customer {}</customer><total>{}.25</total></order>",
            i,
            i % 97,
            i % 1000
        ));
    }
    s.push_str("</orders>");
    s
}

fn bench_parse_query(c: &mut Criterion) {
    let args: Vec<String> = [
        "Customer:customer",
        "Orders:count[id]",
        "Revenue:round[sum[total],2]",
        "where[total>100]",
        "sort[-Orders,Customer]",
        "top[10]",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    c.bench_function("parse_query", |b| {
        b.iter(|| parse_query(black_box(&args)).unwrap())
    });
}

fn bench_stream_rows(c: &mut Criterion) {
    let input = synthetic_orders_xml(10_000);
    let args: Vec<String> = ["id", "customer", "total"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("project_10k_rows", |b| {
        b.iter(|| {
            let parsed = parse_query(&args).unwrap();
            let count = Rc::new(RefCell::new(0usize));
            let sink = count.clone();
            let mut engine = Engine::new(parsed.spec, Arc::new(AtomicBool::new(false)));
            engine.set_row_callback(Box::new(move |_row, _| {
                *sink.borrow_mut() += 1;
            }));
            engine.reset(PassType::Main);
            engine.feed(black_box(input.as_bytes())).unwrap();
            engine.finish().unwrap();
            assert_eq!(*count.borrow(), 10_000);
        })
    });
    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let input = synthetic_orders_xml(10_000);
    let args: Vec<String> = ["customer", "n:count[id]", "t:sum[total]"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    c.bench_function("aggregate_10k_rows", |b| {
        b.iter(|| {
            let parsed = parse_query(&args).unwrap();
            let mut engine = Engine::new(parsed.spec, Arc::new(AtomicBool::new(false)));
            engine.set_row_callback(Box::new(|_row, _| {}));
            for pass in engine.pass_types() {
                engine.reset(pass);
                match pass {
                    PassType::StoredValues => engine.output_stored_rows(),
                    _ => {
                        engine.feed(input.as_bytes()).unwrap();
                        engine.finish().unwrap();
                    }
                }
            }
        })
    });
}

criterion_group!(benches, bench_parse_query, bench_stream_rows, bench_aggregate);
criterion_main!(benches);

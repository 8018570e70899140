//! Envelope codec benchmarks for burrow-protocol.

use burrow_protocol::{codec, Envelope};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_encode_small(c: &mut Criterion) {
    let envelope = Envelope::new("test", "a".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::encode(black_box(&envelope)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let envelope = Envelope::new("test", "a".repeat(64));
    let encoded = codec::encode(&envelope).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip_json_payload(c: &mut Criterion) {
    // Escaping-heavy payload, the common case for JSON-in-JSON events
    let payload = r#"{"id":42,"items":[{"sku":"a-1","qty":2},{"sku":"b-7","qty":1}],"note":"\"gift\""}"#;
    let envelope = Envelope::new("order.created", payload);

    c.bench_function("roundtrip_json_payload", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&envelope)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip_json_payload
);
criterion_main!(benches);

//! ack field 인코딩/디코딩 벤치마크

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ackline::{AckField, Frame, Message, ReceivedMap};

fn received_with_gaps(count: i32) -> ReceivedMap {
    // 대략 4개 중 1개 손실
    (1..=count).filter(|id| id % 4 != 0).map(|id| (id, false)).collect()
}

fn bench_encode(c: &mut Criterion) {
    let source = received_with_gaps(256);
    let mut group = c.benchmark_group("ack_field_encode");

    for bits in [8u8, 32, 128, 255] {
        group.bench_with_input(BenchmarkId::from_parameter(bits), &bits, |b, &bits| {
            b.iter(|| AckField::encode(black_box(1), bits, black_box(&source)))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let field = AckField::encode(1, 255, &received_with_gaps(256));
    let mut wire = Vec::new();
    field.write_to(&mut wire);

    c.bench_function("ack_field_decode", |b| {
        b.iter(|| AckField::decode(black_box(&wire)))
    });

    c.bench_function("ack_field_apply", |b| {
        b.iter(|| {
            let mut confirmed = ReceivedMap::new();
            field.apply_to(&mut confirmed);
            confirmed
        })
    });
}

fn bench_frame(c: &mut Criterion) {
    let field = AckField::encode(1, 32, &received_with_gaps(64));
    let frame = Frame::new(
        1000,
        Some(field),
        Message::Request(bytes::Bytes::from(vec![0xAB; 512])),
    );
    let encoded = frame.encode();

    c.bench_function("frame_encode", |b| b.iter(|| black_box(&frame).encode()));
    c.bench_function("frame_decode", |b| {
        b.iter(|| Frame::decode(black_box(&encoded)))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_frame);
criterion_main!(benches);

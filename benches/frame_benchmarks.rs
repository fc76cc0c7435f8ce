// ABOUTME: Benchmark suite for the muxado frame codec
// ABOUTME: Measures header packing, frame encoding, and decode throughput across body sizes

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use muxado::ErrorCode;
use muxado::StreamId;
use muxado::frame::{Flags, FrameHeader, FrameType, HEADER_SIZE, WireFrame};
use std::time::Duration;

fn sample_header() -> FrameHeader {
    FrameHeader {
        length: 0x1234,
        typ: FrameType::Data,
        flags: Flags::SYN,
        stream_id: StreamId::new(0x2843).unwrap(),
    }
}

fn bench_header_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_encode");
    group.measurement_time(Duration::from_secs(10));

    let header = sample_header();
    group.bench_function("pack_common", |b| {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        b.iter(|| {
            buf.clear();
            black_box(&header).encode(&mut buf).unwrap();
            black_box(&buf);
        });
    });

    group.finish();
}

fn bench_header_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_decode");
    group.measurement_time(Duration::from_secs(10));

    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    sample_header().encode(&mut buf).unwrap();
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&buf);

    group.bench_function("read_common", |b| {
        b.iter(|| black_box(FrameHeader::decode(black_box(raw))));
    });

    group.finish();
}

fn bench_control_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_frames");
    group.measurement_time(Duration::from_secs(10));

    let rst = WireFrame::Rst {
        stream_id: StreamId::new(7).unwrap(),
        code: ErrorCode::StreamReset,
    };
    let wndinc = WireFrame::WndInc {
        stream_id: StreamId::new(7).unwrap(),
        increment: 65536,
    };
    let goaway = WireFrame::GoAway {
        last_stream_id: StreamId::new(301).unwrap(),
        code: ErrorCode::NoError,
        debug: Bytes::from_static(b"shutting down"),
    };

    for (name, frame) in [("rst", &rst), ("wndinc", &wndinc), ("goaway", &goaway)] {
        group.bench_function(name, |b| {
            let mut buf = BytesMut::with_capacity(64);
            b.iter(|| {
                buf.clear();
                black_box(frame).encode(&mut buf).unwrap();
                black_box(&buf);
            });
        });
    }

    group.finish();
}

fn bench_data_frame_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame_sizes");
    group.measurement_time(Duration::from_secs(10));

    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        let frame = WireFrame::Data {
            stream_id: StreamId::new(1).unwrap(),
            syn: false,
            fin: false,
            body: Bytes::from(vec![0x61u8; size]),
        };
        group.throughput(criterion::Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data_encode", size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(size + HEADER_SIZE);
            b.iter(|| {
                buf.clear();
                black_box(frame).encode(&mut buf).unwrap();
                black_box(&buf);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_header_encode,
    bench_header_decode,
    bench_control_frames,
    bench_data_frame_sizes,
);
criterion_main!(benches);

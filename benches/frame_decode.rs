//! Criterion benchmarks for the per-frame display path.
//!
//! Every live frame goes through decode, optional software debayer and optional white
//! balance before it reaches the display, so these set the ceiling on preview rate.
//!
//! Key metrics:
//! - Decode throughput for mono and color frames at 8 and 16 bits
//! - White balance cost through the gain LUTs
//! - Debayer cost for a raw color-sensor frame
//!
//! Run with: cargo bench --bench frame_decode

use ccd_capture::color::white_balance::apply_to_frame;
use ccd_capture::color::{debayer, BayerPattern, GainGrid, GainLutCache, WhiteBalanceGains};
use ccd_capture::data::decoder::decode;
use ccd_capture::messages::FrameShape;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn frame_bytes(shape: &FrameShape) -> Vec<u8> {
    (0..shape.byte_size()).map(|i| (i % 251) as u8).collect()
}

/// Decode throughput for the shapes a typical sensor produces.
fn decode_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let shapes = vec![
        ("mono8_1280x960", FrameShape::new(1280, 960, 1, 8)),
        ("mono16_1280x960", FrameShape::new(1280, 960, 1, 16)),
        ("color8_1280x960", FrameShape::new(1280, 960, 3, 8)),
        ("mono16_3200x2200", FrameShape::new(3200, 2200, 1, 16)),
    ];

    for (name, shape) in shapes {
        let raw = frame_bytes(&shape);
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode", name), &shape, |b, shape| {
            b.iter(|| decode(black_box(&raw), shape).unwrap());
        });
    }

    group.finish();
}

/// White balance on decoded color frames. LUTs are built once outside the loop.
fn white_balance(c: &mut Criterion) {
    let mut group = c.benchmark_group("white_balance");
    let luts = GainLutCache::build(GainGrid::default());
    let gains = WhiteBalanceGains::new(1.4, 1.0, 1.8);

    for (name, bits) in [("color8", 8u32), ("color16", 16)] {
        let shape = FrameShape::new(1280, 960, 3, bits);
        let frame = decode(&frame_bytes(&shape), &shape).unwrap();
        group.throughput(Throughput::Elements((1280 * 960) as u64));
        group.bench_function(BenchmarkId::new("apply", name), |b| {
            b.iter_batched(
                || frame.clone(),
                |mut f| apply_to_frame(black_box(&mut f), gains, &luts).unwrap(),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Software demosaic of a raw Bayer frame.
fn debayer_raw(c: &mut Criterion) {
    let mut group = c.benchmark_group("debayer");
    let shape = FrameShape::new(1280, 960, 1, 8);
    let frame = decode(&frame_bytes(&shape), &shape).unwrap();

    group.throughput(Throughput::Elements((1280 * 960) as u64));
    group.bench_function("rggb_1280x960", |b| {
        b.iter(|| debayer(black_box(&frame), BayerPattern::Rggb).unwrap());
    });

    group.finish();
}

criterion_group!(benches, decode_throughput, white_balance, debayer_raw);
criterion_main!(benches);

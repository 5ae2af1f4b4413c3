//! Convolver hot-path benchmarks
//!
//! Measures the per-quantum audio-thread cost of the partitioned
//! convolver for a range of impulse lengths. Worker-thread FFT cost shows
//! up indirectly through readout waits.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cv_dsp::{PartitionedConvolver, TimeDomainConvolver};

const QUANTUM: u32 = 64;
const IR_LENGTHS: &[u32] = &[1024, 16384, 131072];

fn decaying_ir(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| (-(i as f32) / len as f32 * 6.0).exp() * if i % 7 == 0 { 0.5 } else { -0.25 })
        .collect()
}

fn bench_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("PartitionedConvolver::process");

    for &ir_len in IR_LENGTHS {
        group.bench_with_input(BenchmarkId::new("mono", ir_len), &ir_len, |b, &ir_len| {
            let ir = decaying_ir(ir_len as usize);
            let mut conv = PartitionedConvolver::new();
            conv.configure(1, 1, ir_len, QUANTUM, QUANTUM, 8192, 0.0).unwrap();
            conv.impdata_create(0, 0, 1, &ir, 0, ir_len as i64).unwrap();
            conv.start_process(0, 0, 1e9 * QUANTUM as f64 / 48000.0).unwrap();

            let input: Vec<f32> = (0..QUANTUM as usize)
                .map(|i| ((i as f32) * 0.13).sin())
                .collect();

            b.iter(|| {
                conv.inpdata(0).copy_from_slice(&input);
                conv.process();
                black_box(conv.outdata(0)[0])
            });
        });
    }

    group.finish();
}

fn bench_time_domain(c: &mut Criterion) {
    c.bench_function("TimeDomainConvolver::run 64", |b| {
        let mut tdc = TimeDomainConvolver::new();
        let ir = decaying_ir(64);
        tdc.configure(&ir, 1.0, 0);

        let input: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.21).sin()).collect();
        let mut out = vec![0.0f32; 64];

        b.iter(|| {
            out.fill(0.0);
            tdc.run(&mut out, black_box(&input));
            black_box(out[63])
        });
    });
}

criterion_group!(benches, bench_process, bench_time_domain);
criterion_main!(benches);

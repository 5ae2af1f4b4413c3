//! Quantified properties of the partitioned convolver
//!
//! Linearity, delayed-identity and energy checks against a time-domain
//! reference, across single-level and threaded multi-level plans.

use cv_dsp::PartitionedConvolver;

/// Deterministic noise in [-0.5, 0.5].
fn noise(n: usize, mut seed: u32) -> Vec<f32> {
    (0..n)
        .map(|_| {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            (seed >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

fn direct_convolve(ir: &[f32], input: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; input.len() + ir.len() - 1];
    for (i, &x) in input.iter().enumerate() {
        if x == 0.0 {
            continue;
        }
        for (j, &h) in ir.iter().enumerate() {
            out[i + j] += x * h;
        }
    }
    out
}

/// Run `input` (zero-padded) through a fresh mono convolver and return
/// `out_len` output samples.
fn convolve(ir: &[f32], input: &[f32], quantum: u32, maxpart: u32, out_len: usize) -> Vec<f32> {
    let mut conv = PartitionedConvolver::new();
    conv.configure(1, 1, ir.len() as u32, quantum, quantum, maxpart, 0.0)
        .unwrap();
    conv.impdata_create(0, 0, 1, ir, 0, ir.len() as i64).unwrap();
    conv.start_process(0, 0, 1e9 * quantum as f64 / 48000.0).unwrap();

    let q = quantum as usize;
    let mut out = Vec::with_capacity(out_len);
    let mut pos = 0;
    while out.len() < out_len {
        for s in conv.inpdata(0).iter_mut() {
            *s = if pos < input.len() { input[pos] } else { 0.0 };
            pos += 1;
        }
        conv.process();
        out.extend_from_slice(&conv.outdata(0)[..q]);
    }
    out.truncate(out_len);
    out
}

#[test]
fn linearity_of_superposition() {
    // conv(a*x1 + b*x2) == a*conv(x1) + b*conv(x2)
    let ir = noise(900, 31);
    let x1 = noise(2048, 32);
    let x2 = noise(2048, 33);
    let (a, b) = (0.7f32, -1.3f32);

    let mixed: Vec<f32> = x1.iter().zip(x2.iter()).map(|(&p, &q)| a * p + b * q).collect();

    let y1 = convolve(&ir, &x1, 64, 512, 2048);
    let y2 = convolve(&ir, &x2, 64, 512, 2048);
    let ym = convolve(&ir, &mixed, 64, 512, 2048);

    let scale: f32 = ym.iter().map(|s| s.abs()).fold(0.0, f32::max).max(1e-3);
    for i in 0..2048 {
        let expect = a * y1[i] + b * y2[i];
        assert!(
            (ym[i] - expect).abs() / scale < 1e-5,
            "sample {}: {} vs {}",
            i,
            ym[i],
            expect
        );
    }
}

#[test]
fn identity_impulse_at_zero_delay() {
    let input = noise(1024, 41);
    let out = convolve(&[1.0], &input, 64, 64, 1024);
    for i in 0..1024 {
        assert!(
            (out[i] - input[i]).abs() < 1e-5,
            "sample {}: {} vs {}",
            i,
            out[i],
            input[i]
        );
    }
}

#[test]
fn identity_impulse_below_partition_size() {
    // Unit impulse at delay d < partition size delays the input by d.
    let d = 37;
    let mut ir = vec![0.0; d + 1];
    ir[d] = 1.0;

    let input = noise(1024, 42);
    let out = convolve(&ir, &input, 64, 64, 1024);
    for i in 0..1024 {
        let expect = if i >= d { input[i - d] } else { 0.0 };
        assert!(
            (out[i] - expect).abs() < 1e-5,
            "sample {}: {} vs {}",
            i,
            out[i],
            expect
        );
    }
}

#[test]
fn multi_level_tail_is_complete() {
    // An IR spanning several partition sizes must match the reference
    // over the whole tail, including the part served by worker threads.
    let ir = noise(8192, 51);
    let input = noise(2048, 52);
    let out_len = 2048 + 8192;

    let out = convolve(&ir, &input, 64, 8192, out_len);
    let expect = direct_convolve(&ir, &input);

    for i in 0..expect.len().min(out_len) {
        assert!(
            (out[i] - expect[i]).abs() < 8e-3,
            "sample {}: {} vs {}",
            i,
            out[i],
            expect[i]
        );
    }
}

#[test]
fn output_energy_approaches_parseval_bound() {
    let ir = noise(1000, 61);
    let input = noise(8192, 62);
    let out_len = 8192 + 1000;

    let out = convolve(&ir, &input, 64, 512, out_len);
    let expect = direct_convolve(&ir, &input);

    let e_out: f64 = out.iter().map(|&s| (s as f64) * s as f64).sum();
    let e_ref: f64 = expect.iter().map(|&s| (s as f64) * s as f64).sum();
    assert!(
        (e_out - e_ref).abs() / e_ref < 1e-3,
        "engine energy {} vs reference {}",
        e_out,
        e_ref
    );

    // For white noise the captured energy approaches |x|^2 * |h|^2 once
    // the whole tail has been emitted.
    let e_x: f64 = input.iter().map(|&s| (s as f64) * s as f64).sum();
    let e_h: f64 = ir.iter().map(|&s| (s as f64) * s as f64).sum();
    let ratio = e_out / (e_x * e_h);
    assert!(
        (ratio - 1.0).abs() < 0.2,
        "energy ratio {} too far from 1",
        ratio
    );
}

#[test]
fn tail_energy_grows_until_ir_length_consumed() {
    let ir = noise(2000, 71);
    let input = noise(512, 72);

    let short = convolve(&ir, &input, 64, 512, 1000);
    let full = convolve(&ir, &input, 64, 512, 512 + 2000);

    let e_short: f64 = short.iter().map(|&s| (s as f64) * s as f64).sum();
    let e_full: f64 = full.iter().map(|&s| (s as f64) * s as f64).sum();
    assert!(e_full > e_short * 1.2, "tail energy missing: {} vs {}", e_full, e_short);
}

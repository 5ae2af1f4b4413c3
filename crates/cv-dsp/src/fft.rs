//! Shared FFT plan cache
//!
//! Plan creation is serialized by a process-wide lock; plans are handed
//! out as cheaply clonable `Arc`s. Plans are only ever created or dropped
//! while an engine is being configured or torn down, never from the audio
//! callback or a convolution worker mid-cycle.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use cv_core::Sample;

static PLANNER: Lazy<Mutex<RealFftPlanner<Sample>>> =
    Lazy::new(|| Mutex::new(RealFftPlanner::new()));

/// Forward/inverse real-FFT plan pair for one FFT length.
pub(crate) struct FftPair {
    pub fwd: Arc<dyn RealToComplex<Sample>>,
    pub inv: Arc<dyn ComplexToReal<Sample>>,
}

/// Acquire the plan pair for `fft_len` (must be even and non-zero).
pub(crate) fn fft_pair(fft_len: usize) -> FftPair {
    let mut planner = PLANNER.lock();
    FftPair {
        fwd: planner.plan_fft_forward(fft_len),
        inv: planner.plan_fft_inverse(fft_len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::num_complex::Complex;

    #[test]
    fn test_roundtrip_scaling() {
        // realfft forward + inverse are unnormalized: a roundtrip scales
        // the signal by the FFT length. The convolver folds 0.5/parsize
        // into the impulse spectra to compensate (fft_len = 2 * parsize).
        let n = 128;
        let pair = fft_pair(n);

        let mut time: Vec<Sample> = (0..n).map(|i| ((i as f32) * 0.37).sin()).collect();
        let original = time.clone();
        let mut freq = vec![Complex::new(0.0, 0.0); n / 2 + 1];

        let mut scratch = vec![Complex::new(0.0, 0.0); pair.fwd.get_scratch_len()];
        pair.fwd
            .process_with_scratch(&mut time, &mut freq, &mut scratch)
            .unwrap();

        let mut back = vec![0.0; n];
        let mut scratch = vec![Complex::new(0.0, 0.0); pair.inv.get_scratch_len()];
        pair.inv
            .process_with_scratch(&mut freq, &mut back, &mut scratch)
            .unwrap();

        for (i, (&a, &b)) in original.iter().zip(back.iter()).enumerate() {
            assert!(
                (a * n as f32 - b).abs() < 1e-3,
                "bin {}: {} vs {}",
                i,
                a * n as f32,
                b
            );
        }
    }
}

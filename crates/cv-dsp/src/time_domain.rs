//! Short time-domain FIR used for zero-latency partial cycles
//!
//! The smallest FFT level needs a full quantum of input before it can run.
//! When the host hands the engine a block that does not complete the
//! current quantum, the contribution of the impulse-response head to those
//! fresh samples is computed directly in the time domain instead, while
//! `tailonly` supplies the already-computed tails of the larger levels.

use cv_core::Sample;

/// Number of taps held by the time-domain stage.
const TAPS: usize = 64;

/// Direct-form FIR over the first taps of the impulse response.
#[derive(Debug, Clone)]
pub struct TimeDomainConvolver {
    ir: [Sample; TAPS],
    enabled: bool,
}

impl Default for TimeDomainConvolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeDomainConvolver {
    pub fn new() -> Self {
        Self {
            ir: [0.0; TAPS],
            enabled: false,
        }
    }

    /// Disable the stage and clear its taps.
    pub fn reset(&mut self) {
        self.ir = [0.0; TAPS];
        self.enabled = false;
    }

    /// Load the head of an impulse response.
    ///
    /// `ir_head` is the start of the (per-slot) impulse response; `gain`
    /// is the slot gain and `delay` the slot pre-delay in samples. Taps
    /// `[delay, TAPS)` are filled from the IR start; a delay of `TAPS` or
    /// more leaves the stage disabled (the FFT levels cover it).
    pub fn configure(&mut self, ir_head: &[Sample], gain: Sample, delay: u32) {
        let delay = delay as usize;
        if delay >= TAPS {
            return;
        }
        let to_read = (TAPS - delay).min(ir_head.len());
        if to_read == 0 {
            return;
        }

        for (tap, &s) in self.ir[delay..delay + to_read].iter_mut().zip(ir_head) {
            *tap = s * gain;
        }
        self.enabled = self.ir.iter().any(|&s| s != 0.0);
    }

    /// Whether the stage holds any non-zero taps.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Convolve `inp` against the stored taps, adding into `out`.
    ///
    /// Triangular form: only terms that land inside the current partial
    /// block are produced, so nothing is written past `out[n)`.
    pub fn run(&self, out: &mut [Sample], inp: &[Sample]) {
        if !self.enabled {
            return;
        }
        let n = out.len().min(inp.len());
        for i in 0..n {
            let x = inp[i];
            if x == 0.0 {
                continue;
            }
            for (o, &h) in out[i..n].iter_mut().zip(self.ir.iter()) {
                *o += x * h;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impulse_reproduces_ir_head() {
        let mut tdc = TimeDomainConvolver::new();
        let ir = [1.0, 0.5, 0.25];
        tdc.configure(&ir, 1.0, 0);
        assert!(tdc.enabled());

        let inp = [1.0, 0.0, 0.0, 0.0, 0.0];
        let mut out = [0.0; 5];
        tdc.run(&mut out, &inp);
        assert_eq!(&out[..3], &[1.0, 0.5, 0.25]);
        assert_eq!(&out[3..], &[0.0, 0.0]);
    }

    #[test]
    fn test_gain_and_delay() {
        let mut tdc = TimeDomainConvolver::new();
        tdc.configure(&[1.0], 0.5, 3);

        let inp = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut out = [0.0; 6];
        tdc.run(&mut out, &inp);
        assert_eq!(out[3], 0.5);
        assert!(out.iter().enumerate().all(|(i, &s)| i == 3 || s == 0.0));
    }

    #[test]
    fn test_delay_beyond_taps_disables() {
        let mut tdc = TimeDomainConvolver::new();
        tdc.configure(&[1.0; 8], 1.0, 64);
        assert!(!tdc.enabled());

        let mut out = [0.0; 4];
        tdc.run(&mut out, &[1.0; 4]);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_triangular_stays_in_block() {
        let mut tdc = TimeDomainConvolver::new();
        tdc.configure(&[1.0; 64], 1.0, 0);

        // Every input sample contributes only to out[i..n).
        let inp = [1.0, 1.0, 1.0];
        let mut out = [0.0; 3];
        tdc.run(&mut out, &inp);
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zero_gain_stays_disabled() {
        let mut tdc = TimeDomainConvolver::new();
        tdc.configure(&[1.0, 1.0], 0.0, 0);
        assert!(!tdc.enabled());
    }
}

//! Dry-signal delay line
//!
//! The buffered run paths delay the dry signal by one quantum so that the
//! dry/wet mix stays time-aligned with the one-block-latent wet signal.
//! `clear` is cheap when nothing was written since the last clear, so the
//! common all-wet case pays nothing.

use cv_core::Sample;

/// Fixed single-channel delay, processing in place.
#[derive(Debug, Clone, Default)]
pub struct DelayLine {
    buf: Vec<Sample>,
    delay: usize,
    pos: usize,
    written: bool,
}

impl DelayLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay length and zero the history.
    pub fn reset(&mut self, delay: usize) {
        self.buf.clear();
        self.buf.resize(delay + 1, 0.0);
        self.delay = delay;
        self.pos = 0;
        self.written = false;
    }

    /// Zero the history if anything was written since the last clear.
    pub fn clear(&mut self) {
        if !self.written || self.buf.is_empty() {
            return;
        }
        self.buf.fill(0.0);
        self.written = false;
    }

    /// Delay `buf` in place by the configured amount.
    pub fn run(&mut self, buf: &mut [Sample]) {
        self.written = !buf.is_empty();
        for s in buf.iter_mut() {
            self.buf[self.pos] = *s;
            self.pos += 1;
            if self.pos > self.delay {
                self.pos = 0;
            }
            *s = self.buf[self.pos];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_by_configured_amount() {
        let mut dly = DelayLine::new();
        dly.reset(3);

        let mut buf: Vec<Sample> = (1..=8).map(|i| i as Sample).collect();
        dly.run(&mut buf);
        assert_eq!(buf, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_zero_delay_passthrough() {
        let mut dly = DelayLine::new();
        dly.reset(0);

        let mut buf = vec![0.5, -0.5, 1.0];
        dly.run(&mut buf);
        assert_eq!(buf, vec![0.5, -0.5, 1.0]);
    }

    #[test]
    fn test_clear_flushes_history() {
        let mut dly = DelayLine::new();
        dly.reset(2);

        let mut buf = vec![1.0, 2.0, 3.0];
        dly.run(&mut buf);
        dly.clear();

        let mut buf = vec![0.0, 0.0, 0.0];
        dly.run(&mut buf);
        assert_eq!(buf, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_state_persists_across_calls() {
        let mut dly = DelayLine::new();
        dly.reset(2);

        let mut a = vec![1.0, 2.0];
        let mut b = vec![3.0, 4.0];
        dly.run(&mut a);
        dly.run(&mut b);
        assert_eq!(a, vec![0.0, 0.0]);
        assert_eq!(b, vec![1.0, 2.0]);
    }
}

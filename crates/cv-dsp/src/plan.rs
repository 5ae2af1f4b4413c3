//! Partition plan construction
//!
//! The impulse response is covered by an ordered list of levels, each
//! holding `npar` partitions of `parsize` samples. Partition sizes start
//! at the quantum and grow monotonically, so early parts of the IR are
//! convolved with low latency while the long tail amortizes FFT cost
//! across many audio cycles.
//!
//! The plan is built greedily against a simple cost model: doubling the
//! partition size halves the number of MAC passes per tap but adds FFT
//! work at the larger size. A level is cut short (trimmed toward `nmin`
//! partitions) whenever the MACs saved by moving the remaining taps to
//! the next, larger level outweigh the extra FFT cost there.

/// Relative FFT cost per channel.
pub const FFT_COST: f32 = 5.0;

/// Relative MAC cost per tap at full density.
pub const MAC_COST: f32 = 1.0;

/// One partition level of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSpec {
    /// Scheduling priority relative to the caller's base priority.
    pub prio: i32,
    /// Offset of this level's first partition into the IR, in samples.
    pub offs: u32,
    /// Number of partitions.
    pub npar: u32,
    /// Partition size in samples (power of two).
    pub parsize: u32,
}

/// Build the partition plan for an IR of `maxsize` samples.
///
/// Parameters are assumed validated (powers of two, ordered); the
/// convolver checks them before calling. Returns the level list and the
/// effective largest partition size actually used.
pub fn build_plan(
    ninp: u32,
    nout: u32,
    maxsize: u32,
    quantum: u32,
    minpart: u32,
    maxpart: u32,
    density: f32,
) -> (Vec<LevelSpec>, u32) {
    let nmin_ch = ninp.min(nout) as f32;
    let mut density = density;
    if density <= 0.0 {
        density = 1.0 / nmin_ch;
    }
    if density > 1.0 {
        density = 1.0;
    }

    let cfft = FFT_COST * (ninp + nout) as f32;
    let cmac = MAC_COST * (ninp * nout) as f32 * density;

    // When FFTs are cheap relative to MACs, grow partition sizes by
    // doubling; otherwise quadruple to reach the efficient sizes sooner.
    let step: u32 = if cfft < 4.0 * cmac { 1 } else { 2 };
    let mut s: u32 = if step == 2 {
        let r = maxpart / minpart;
        if r & 0xAAAA != 0 {
            1
        } else {
            2
        }
    } else {
        1
    };

    let mut nmin: u32 = if s == 1 { 2 } else { 6 };
    if minpart == quantum {
        nmin += 1;
    }

    let mut prio: i32 = 0;
    let mut size = quantum;
    while size < minpart {
        prio -= 1;
        size <<= 1;
    }

    let mut levels = Vec::new();
    let mut offs: u32 = 0;

    while offs < maxsize {
        let mut npar = (maxsize - offs).div_ceil(size);
        if size < maxpart && npar > nmin {
            // Trim toward nmin when the MACs saved at the next level
            // dominate the extra per-cycle FFT there.
            let r = 1u32 << s;
            let d = npar - nmin;
            let d = d - d.div_ceil(r);
            if cfft < d as f32 * cmac {
                npar = nmin;
            }
        }
        levels.push(LevelSpec {
            prio,
            offs,
            npar,
            parsize: size,
        });
        offs += size * npar;
        if offs < maxsize {
            prio -= s as i32;
            size <<= s;
            s = step;
            nmin = if s == 1 { 2 } else { 6 };
        }
    }

    (levels, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariants(levels: &[LevelSpec], maxsize: u32, quantum: u32, minpart: u32) {
        assert!(!levels.is_empty());
        assert_eq!(levels[0].parsize, minpart.max(quantum));

        let mut expect_offs = 0u32;
        let mut prev_size = 0u32;
        let mut covered = 0u64;
        for lvl in levels {
            assert!(lvl.parsize.is_power_of_two());
            assert!(lvl.parsize >= prev_size, "sizes must grow monotonically");
            assert_eq!(lvl.offs, expect_offs, "offsets must be cumulative");
            assert!(lvl.npar >= 1);
            expect_offs += lvl.parsize * lvl.npar;
            covered += (lvl.parsize * lvl.npar) as u64;
            prev_size = lvl.parsize;
        }
        assert!(covered >= maxsize as u64, "plan must cover the whole IR");
    }

    #[test]
    fn test_single_level_short_ir() {
        let (levels, _) = build_plan(1, 1, 100, 64, 64, 64, 0.0);
        check_invariants(&levels, 100, 64, 64);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].npar, 2);
    }

    #[test]
    fn test_long_ir_multi_level() {
        let maxsize = 1 << 20;
        let (levels, maxpart) = build_plan(1, 1, maxsize, 64, 64, 8192, 0.0);
        check_invariants(&levels, maxsize, 64, 64);
        assert!(levels.len() > 2);
        assert_eq!(maxpart, 8192);
        // Tail must be handled by the largest partitions.
        assert_eq!(levels.last().unwrap().parsize, 8192);
    }

    #[test]
    fn test_priority_decreases_with_size() {
        let (levels, _) = build_plan(2, 2, 1 << 18, 64, 64, 8192, 0.0);
        for pair in levels.windows(2) {
            assert!(pair[1].prio < pair[0].prio);
        }
        assert_eq!(levels[0].prio, 0);
    }

    #[test]
    fn test_minpart_above_quantum_starts_negative() {
        let (levels, _) = build_plan(1, 1, 4096, 64, 256, 8192, 0.0);
        check_invariants(&levels, 4096, 64, 256);
        // Two doublings from quantum 64 to minpart 256.
        assert_eq!(levels[0].prio, -2);
        assert_eq!(levels[0].parsize, 256);
    }

    #[test]
    fn test_full_length_ir() {
        let maxsize = 1 << 24;
        let (levels, _) = build_plan(2, 2, maxsize, 64, 64, 8192, 0.0);
        check_invariants(&levels, maxsize, 64, 64);
        assert!(levels.len() <= 8);
    }
}

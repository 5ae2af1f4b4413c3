//! One partition level: impulse spectra, worker thread, ring plumbing
//!
//! A level owns `npar` partitions of `parsize` samples starting at `offs`
//! into the impulse response. Per cycle it forward-FFTs the newest
//! `parsize` input samples, multiply-accumulates them against the impulse
//! spectra across the frequency-delay line, inverse-FFTs and overlap-adds
//! the result.
//!
//! Levels whose partition size exceeds the engine quantum run this cycle
//! on a dedicated worker thread; the smallest level runs it inline on the
//! audio thread. Audio moves between threads through wait-free SPSC rings
//! (one per active input and output channel), and cycles are paced by a
//! trigger/done channel pair. Ring priming reproduces the half-partition
//! scheduling stagger of the classic shared-buffer formulation: a level
//! with `parsize > outsize` fires its first cycle after `parsize / 2`
//! samples, reading a window that is half zeros, and its first computed
//! block reaches the output after a further full partition.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use rtrb::{Consumer, Producer, RingBuffer};
use rustfft::num_complex::Complex;

use cv_core::{Error, Result, Sample};

use crate::fft::{fft_pair, FftPair};
use crate::plan::LevelSpec;
use crate::rt::{promote_current_thread, RtParams};

/// Worker lifecycle states, shared through an atomic.
pub(crate) mod level_state {
    pub const IDLE: u8 = 0;
    pub const PROC: u8 = 1;
    pub const TERM: u8 = 2;
    pub const FAILED: u8 = 3;
}

/// Frequency-domain input history for one engine input channel.
struct InputNode {
    /// Engine input channel index.
    inp: usize,
    /// Input samples from the audio thread; attached at start.
    ring: Option<Consumer<Sample>>,
    /// Ring of the last `npar` input spectra, `parsize + 1` bins each.
    fdl: Vec<Vec<Complex<Sample>>>,
}

/// One (input, output) convolution term at this level.
struct MacNode {
    /// Index into the level's input-node array.
    input_slot: usize,
    /// Impulse spectra per partition; `None` for all-zero partitions.
    spectra: Vec<Option<Vec<Complex<Sample>>>>,
}

/// Accumulation target for one engine output channel.
struct OutputNode {
    /// Engine output channel index.
    out: usize,
    /// Output samples to the audio thread; attached at start.
    ring: Option<Producer<Sample>>,
    /// Saved second half of the last inverse FFT.
    overlap: Vec<Sample>,
    /// Convolution terms feeding this output.
    macs: Vec<MacNode>,
}

/// Heavy per-level state. Lives on the audio thread while the level is
/// being configured and filled, then moves onto the worker thread for the
/// lifetime of the run (except for the synchronous smallest level, which
/// keeps it on the audio thread).
pub(crate) struct LevelCore {
    parsize: usize,
    npar: usize,
    offs: u32,
    /// Frequency-delay-line cursor; advances once per cycle.
    ptind: usize,
    inputs: Vec<InputNode>,
    outputs: Vec<OutputNode>,
    fft: FftPair,
    /// Time-domain workspace, `2 * parsize`.
    time_data: Vec<Sample>,
    /// Impulse staging buffer for `impdata_write`, `2 * parsize`.
    prep_data: Vec<Sample>,
    /// Frequency-domain workspace, `parsize + 1` bins.
    freq_data: Vec<Complex<Sample>>,
    /// realfft scratch, sized for the larger of the two transforms.
    scratch: Vec<Complex<Sample>>,
}

impl LevelCore {
    fn new(spec: &LevelSpec) -> Self {
        let parsize = spec.parsize as usize;
        let fft = fft_pair(2 * parsize);
        let scratch_len = fft.fwd.get_scratch_len().max(fft.inv.get_scratch_len());
        Self {
            parsize,
            npar: spec.npar as usize,
            offs: spec.offs,
            ptind: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            fft,
            time_data: vec![0.0; 2 * parsize],
            prep_data: vec![0.0; 2 * parsize],
            freq_data: vec![Complex::new(0.0, 0.0); parsize + 1],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    /// Locate the MAC node for (inp, out), creating the input node, the
    /// output node and the MAC record on demand when `create` is set.
    /// Returns (output index, mac index) or None.
    fn find_mac(&mut self, inp: usize, out: usize, create: bool) -> Option<(usize, usize)> {
        let input_slot = match self.inputs.iter().position(|x| x.inp == inp) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                self.inputs.push(InputNode {
                    inp,
                    ring: None,
                    fdl: (0..self.npar)
                        .map(|_| vec![Complex::new(0.0, 0.0); self.parsize + 1])
                        .collect(),
                });
                self.inputs.len() - 1
            }
        };

        let out_slot = match self.outputs.iter().position(|y| y.out == out) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                self.outputs.push(OutputNode {
                    out,
                    ring: None,
                    overlap: vec![0.0; self.parsize],
                    macs: Vec::new(),
                });
                self.outputs.len() - 1
            }
        };

        let macs = &mut self.outputs[out_slot].macs;
        let mac_slot = match macs.iter().position(|m| m.input_slot == input_slot) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                macs.push(MacNode {
                    input_slot,
                    spectra: (0..self.npar).map(|_| None).collect(),
                });
                macs.len() - 1
            }
        };

        Some((out_slot, mac_slot))
    }

    /// Accumulate a chunk of impulse samples into this level's spectra.
    ///
    /// `data[j * stride]` for `j in [0, ind1 - ind0)` holds the IR
    /// samples for absolute frame positions `[ind0, ind1)`. Only the part
    /// that falls inside this level's window is taken; each partition is
    /// zero-padded, forward-FFT'd with the `0.5 / parsize` normalization
    /// folded in, and complex-added onto any spectra already present so
    /// that an IR can be deposited in chunks.
    fn impdata_write(
        &mut self,
        inp: usize,
        out: usize,
        stride: usize,
        data: &[Sample],
        ind0: i64,
        ind1: i64,
        create: bool,
    ) {
        let n = ind1 - ind0;
        let mut i0 = self.offs as i64 - ind0;
        let i1 = i0 + (self.npar * self.parsize) as i64;
        if i0 >= n || i1 <= 0 {
            return;
        }

        let Some((out_slot, mac_slot)) = self.find_mac(inp, out, create) else {
            return;
        };

        let parsize = self.parsize;
        let norm = 0.5 / parsize as Sample;

        for k in 0..self.npar {
            let i1 = i0 + parsize as i64;
            if i0 < n && i1 > 0 {
                let spectra = &mut self.outputs[out_slot].macs[mac_slot].spectra;
                if spectra[k].is_none() {
                    if !create {
                        i0 = i1;
                        continue;
                    }
                    spectra[k] = Some(vec![Complex::new(0.0, 0.0); parsize + 1]);
                }

                self.prep_data.fill(0.0);
                let j0 = i0.max(0);
                let j1 = i1.min(n);
                for j in j0..j1 {
                    self.prep_data[(j - i0) as usize] = norm * data[j as usize * stride];
                }

                // Errors can only come from mismatched buffer lengths,
                // which are fixed at construction.
                let _ = self.fft.fwd.process_with_scratch(
                    &mut self.prep_data,
                    &mut self.freq_data,
                    &mut self.scratch,
                );

                let dst = self.outputs[out_slot].macs[mac_slot].spectra[k]
                    .as_mut()
                    .expect("spectrum allocated above");
                for (d, s) in dst.iter_mut().zip(self.freq_data.iter()) {
                    *d += s;
                }
            }
            i0 = i1;
        }
    }

    /// Zero the spectra of one (inp, out) pair, keeping the allocation.
    fn impdata_clear(&mut self, inp: usize, out: usize) {
        let Some((out_slot, mac_slot)) = self.find_mac(inp, out, false) else {
            return;
        };
        for spec in self.outputs[out_slot].macs[mac_slot].spectra.iter_mut() {
            if let Some(spec) = spec {
                spec.fill(Complex::new(0.0, 0.0));
            }
        }
    }

    /// Zero the processing history (input spectra, overlap, cursor). The
    /// impulse spectra are kept.
    fn reset(&mut self) {
        for node in self.inputs.iter_mut() {
            for spec in node.fdl.iter_mut() {
                spec.fill(Complex::new(0.0, 0.0));
            }
        }
        for node in self.outputs.iter_mut() {
            node.overlap.fill(0.0);
        }
        self.ptind = 0;
    }

    /// Run one convolution cycle: FFT the newest partition of every
    /// active input, MAC across the frequency-delay line into every
    /// active output, inverse-FFT, overlap-add, publish one block.
    fn process_cycle(&mut self) {
        let Self {
            parsize,
            npar,
            ptind,
            inputs,
            outputs,
            fft,
            time_data,
            freq_data,
            scratch,
            ..
        } = self;
        let parsize = *parsize;
        let npar = *npar;

        for node in inputs.iter_mut() {
            let ring = node.ring.as_mut().expect("input ring attached at start");
            let got = pop_into(ring, &mut time_data[..parsize]);
            if got < parsize {
                // Starved ring: treat the gap as silence. The pacing
                // protocol guarantees this does not happen.
                time_data[got..parsize].fill(0.0);
            }
            time_data[parsize..].fill(0.0);
            let _ = fft
                .fwd
                .process_with_scratch(time_data, &mut node.fdl[*ptind], scratch);
        }

        for node in outputs.iter_mut() {
            freq_data.fill(Complex::new(0.0, 0.0));

            for mac in node.macs.iter() {
                let fdl = &inputs[mac.input_slot].fdl;
                // Partition j convolves with the input block from j
                // cycles ago.
                let mut i = *ptind;
                for spec in mac.spectra.iter() {
                    if let Some(spec) = spec {
                        let ffta = &fdl[i];
                        for (acc, (&a, &b)) in
                            freq_data.iter_mut().zip(ffta.iter().zip(spec.iter()))
                        {
                            *acc += a * b;
                        }
                    }
                    i = if i == 0 { npar - 1 } else { i - 1 };
                }
            }

            // DC and Nyquist bins of a real spectrum product are real.
            freq_data[0].im = 0.0;
            freq_data[parsize].im = 0.0;
            let _ = fft.inv.process_with_scratch(freq_data, time_data, scratch);

            let ring = node.ring.as_mut().expect("output ring attached at start");
            if let Ok(mut chunk) = ring.write_chunk(parsize) {
                let (head, tail) = chunk.as_mut_slices();
                let split = head.len();
                for (dst, (&t, &o)) in head
                    .iter_mut()
                    .zip(time_data[..split].iter().zip(node.overlap[..split].iter()))
                {
                    *dst = t + o;
                }
                for (dst, (&t, &o)) in tail.iter_mut().zip(
                    time_data[split..parsize]
                        .iter()
                        .zip(node.overlap[split..].iter()),
                ) {
                    *dst = t + o;
                }
                chunk.commit_all();
            }
            node.overlap.copy_from_slice(&time_data[parsize..]);
        }

        *ptind = (*ptind + 1) % npar;
    }
}

/// Copy up to `dst.len()` samples out of a ring. Returns the count.
fn pop_into(ring: &mut Consumer<Sample>, dst: &mut [Sample]) -> usize {
    let want = dst.len().min(ring.slots());
    match ring.read_chunk(want) {
        Ok(chunk) => {
            let (a, b) = chunk.as_slices();
            dst[..a.len()].copy_from_slice(a);
            dst[a.len()..a.len() + b.len()].copy_from_slice(b);
            chunk.commit_all();
            want
        }
        Err(_) => 0,
    }
}

/// Push all of `src` into a ring. Silently drops on overflow, which the
/// pacing protocol rules out.
fn push_from(ring: &mut Producer<Sample>, src: &[Sample]) {
    if let Ok(mut chunk) = ring.write_chunk(src.len()) {
        let (a, b) = chunk.as_mut_slices();
        let split = a.len();
        a.copy_from_slice(&src[..split]);
        b.copy_from_slice(&src[split..]);
        chunk.commit_all();
    }
}

/// Push `n` zeros into a ring (priming).
fn push_zeros(ring: &mut Producer<Sample>, n: usize) {
    if let Ok(chunk) = ring.write_chunk(n) {
        // write_chunk hands out default-initialized (zero) slots.
        chunk.commit_all();
    }
}

/// Audio-thread handle for one partition level.
pub(crate) struct PartitionLevel {
    spec: LevelSpec,
    /// Samples consumed from the level per engine readout (= minpart).
    outsize: usize,
    /// Late-report bit value, `parsize / outsize`.
    bits: u32,
    outoffs: usize,
    /// A cycle has been triggered and its `done` not yet consumed.
    wait: bool,
    /// Runs inline on the audio thread (parsize == quantum).
    sync: bool,
    /// Present while configured/stopped, or always for a sync level.
    core: Option<Box<LevelCore>>,
    /// (engine input index, producer) pairs, filled at start.
    inp_tx: Vec<(usize, Producer<Sample>)>,
    /// (engine output index, consumer) pairs, filled at start.
    out_rx: Vec<(usize, Consumer<Sample>)>,
    trig_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<()>>,
    state: Arc<AtomicU8>,
    /// Test-only artificial cycle stall, nanoseconds.
    stall_ns: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl PartitionLevel {
    pub fn new(spec: LevelSpec) -> Self {
        Self {
            core: Some(Box::new(LevelCore::new(&spec))),
            spec,
            outsize: 0,
            bits: 0,
            outoffs: 0,
            wait: false,
            sync: false,
            inp_tx: Vec::new(),
            out_rx: Vec::new(),
            trig_tx: None,
            done_rx: None,
            state: Arc::new(AtomicU8::new(level_state::IDLE)),
            stall_ns: Arc::new(AtomicU64::new(0)),
            join: None,
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Worker is running or runs inline.
    pub fn is_proc(&self) -> bool {
        self.sync || self.state() == level_state::PROC
    }

    /// Worker has exited (or never existed).
    pub fn is_idle(&self) -> bool {
        if self.sync || self.join.is_none() {
            return true;
        }
        matches!(self.state(), level_state::IDLE | level_state::FAILED)
    }

    pub fn set_stall_ns(&self, ns: u64) {
        self.stall_ns.store(ns, Ordering::Relaxed);
    }

    pub fn impdata_write(
        &mut self,
        inp: usize,
        out: usize,
        stride: usize,
        data: &[Sample],
        ind0: i64,
        ind1: i64,
        create: bool,
    ) -> Result<()> {
        let core = self
            .core
            .as_mut()
            .ok_or(Error::BadState("impulse data while level is running"))?;
        core.impdata_write(inp, out, stride, data, ind0, ind1, create);
        Ok(())
    }

    pub fn impdata_clear(&mut self, inp: usize, out: usize) {
        if let Some(core) = self.core.as_mut() {
            core.impdata_clear(inp, out);
        }
    }

    /// Zero processing history and set the readout stagger for a run
    /// where `outsize` samples are consumed per engine readout.
    pub fn reset(&mut self, outsize: usize) -> Result<()> {
        let parsize = self.spec.parsize as usize;
        let core = self
            .core
            .as_mut()
            .ok_or(Error::BadState("reset while level is running"))?;
        core.reset();
        self.outsize = outsize;
        self.bits = (parsize / outsize) as u32;
        self.outoffs = if parsize == outsize { 0 } else { parsize / 2 };
        self.wait = false;
        Ok(())
    }

    /// Create and prime the rings, then either keep the core inline
    /// (parsize == quantum) or move it onto a freshly spawned worker.
    pub fn start(&mut self, rt: RtParams, quantum: usize) -> Result<()> {
        let parsize = self.spec.parsize as usize;
        let mut core = self
            .core
            .take()
            .ok_or(Error::BadState("level already started"))?;

        self.sync = parsize == quantum;
        let init_outoffs = self.outoffs;

        self.inp_tx.clear();
        self.out_rx.clear();
        for node in core.inputs.iter_mut() {
            let (mut prod, cons) = RingBuffer::new(4 * parsize);
            push_zeros(&mut prod, init_outoffs);
            node.ring = Some(cons);
            self.inp_tx.push((node.inp, prod));
        }
        for node in core.outputs.iter_mut() {
            let (mut prod, cons) = RingBuffer::new(4 * parsize);
            if !self.sync {
                push_zeros(&mut prod, (parsize - init_outoffs) + parsize - self.outsize);
            }
            node.ring = Some(prod);
            self.out_rx.push((node.out, cons));
        }

        if self.sync {
            self.core = Some(core);
            return Ok(());
        }

        let (trig_tx, trig_rx) = bounded::<()>(4);
        let (done_tx, done_rx) = bounded::<()>(4);
        let state = Arc::clone(&self.state);
        let stall = Arc::clone(&self.stall_ns);
        let rt = RtParams {
            priority: rt.priority + self.spec.prio,
            ..rt
        };

        state.store(level_state::IDLE, Ordering::Release);
        let join = std::thread::Builder::new()
            .name(format!("conv-p{}", parsize))
            .stack_size(8 * 1024 * 1024)
            .spawn(move || level_worker(core, trig_rx, done_tx, state, stall, rt))
            .map_err(|e| Error::ThreadCreate(e.to_string()))?;

        self.trig_tx = Some(trig_tx);
        self.done_rx = Some(done_rx);
        self.join = Some(join);
        Ok(())
    }

    /// Per-readout step: advance the offset, pace the worker at cycle
    /// boundaries, mix `outsize` samples into the engine accumulators.
    /// Returns the level's bit value if the worker had not finished its
    /// previous cycle in time, else 0.
    pub fn readout(&mut self, outbuff: &mut [Vec<Sample>]) -> u32 {
        let parsize = self.spec.parsize as usize;
        let mut late = 0;

        self.outoffs += self.outsize;
        if self.outoffs == parsize {
            self.outoffs = 0;
            if self.sync {
                self.core
                    .as_mut()
                    .expect("sync level keeps its core")
                    .process_cycle();
            } else {
                if self.wait {
                    let done = self.done_rx.as_ref().expect("done channel present");
                    match done.try_recv() {
                        Ok(()) => {}
                        Err(TryRecvError::Empty) => {
                            late = self.bits;
                            let _ = done.recv();
                        }
                        Err(TryRecvError::Disconnected) => {
                            late = self.bits;
                        }
                    }
                    self.wait = false;
                }
                if let Some(trig) = &self.trig_tx {
                    let _ = trig.try_send(());
                    self.wait = true;
                }
            }
        }

        for (out, ring) in self.out_rx.iter_mut() {
            let dst = &mut outbuff[*out];
            if let Ok(chunk) = ring.read_chunk(self.outsize.min(ring.slots())) {
                let (a, b) = chunk.as_slices();
                for (d, &s) in dst.iter_mut().zip(a.iter().chain(b.iter())) {
                    *d += s;
                }
                chunk.commit_all();
            }
        }

        late
    }

    /// Mix the already-computed tail of the previous cycle into the first
    /// `n` samples of the accumulators without consuming it or starting a
    /// new cycle.
    pub fn readtail(&mut self, n: usize, outbuff: &mut [Vec<Sample>]) {
        if self.sync {
            // The tail of the smallest level is the saved overlap half.
            let core = self.core.as_ref().expect("sync level keeps its core");
            for node in core.outputs.iter() {
                let dst = &mut outbuff[node.out];
                for (d, &s) in dst[..n].iter_mut().zip(node.overlap.iter()) {
                    *d += s;
                }
            }
            return;
        }

        let parsize = self.spec.parsize as usize;
        if self.outoffs + self.outsize == parsize && self.wait {
            // The tail window starts in the next block; the cycle that
            // produces it must have finished.
            if let Some(done) = &self.done_rx {
                let _ = done.recv();
            }
            self.wait = false;
        }

        for (out, ring) in self.out_rx.iter_mut() {
            let dst = &mut outbuff[*out];
            if let Ok(chunk) = ring.read_chunk(n.min(ring.slots())) {
                let (a, b) = chunk.as_slices();
                for (d, &s) in dst.iter_mut().zip(a.iter().chain(b.iter())) {
                    *d += s;
                }
                // Dropped without commit: nothing is consumed.
            }
        }
    }

    /// Feed one quantum of input for engine channel `inp`.
    pub fn push_input(&mut self, inp: usize, samples: &[Sample]) {
        for (ch, ring) in self.inp_tx.iter_mut() {
            if *ch == inp {
                push_from(ring, samples);
            }
        }
    }

    /// Ask the worker to terminate after its current cycle.
    pub fn stop(&mut self) {
        if self.join.is_some() {
            self.state.store(level_state::TERM, Ordering::Release);
            if let Some(trig) = &self.trig_tx {
                let _ = trig.try_send(());
            }
        }
    }

    /// Drop the rings and reap the worker. Blocks briefly; only called
    /// from non-real-time context.
    pub fn cleanup(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.trig_tx = None;
        self.done_rx = None;
        self.inp_tx.clear();
        self.out_rx.clear();
    }
}

impl Drop for PartitionLevel {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Worker-thread main loop. Promotes itself to real-time scheduling, then
/// runs one convolution cycle per trigger until told to terminate.
fn level_worker(
    mut core: Box<LevelCore>,
    trig_rx: Receiver<()>,
    done_tx: Sender<()>,
    state: Arc<AtomicU8>,
    stall_ns: Arc<AtomicU64>,
    rt: RtParams,
) {
    if let Err(err) = promote_current_thread(&rt) {
        if cfg!(feature = "hard-rt") {
            log::error!("convolution worker: no real-time scheduling: {}", err);
            state.store(level_state::FAILED, Ordering::Release);
            return;
        }
        log::warn!(
            "convolution worker: running without real-time scheduling: {}",
            err
        );
    }

    state.store(level_state::PROC, Ordering::Release);
    loop {
        if trig_rx.recv().is_err() {
            break;
        }
        if state.load(Ordering::Acquire) == level_state::TERM {
            break;
        }
        let stall = stall_ns.load(Ordering::Relaxed);
        if stall > 0 {
            std::thread::sleep(Duration::from_nanos(stall));
        }
        core.process_cycle();
        let _ = done_tx.try_send(());
    }
    state.store(level_state::IDLE, Ordering::Release);
}

//! One fully configured convolution engine instance
//!
//! A `Convolver` couples IR audio to the partitioned convolution core:
//! it decodes and resamples the IR, maps impulse slots onto engine
//! (input, output) pairs according to the channel configuration, owns the
//! time-domain tail stages and the dry-path delay lines, and provides the
//! audio-thread run paths.
//!
//! Instances are immutable once configured; changing the IR or its
//! settings means building a replacement instance off the audio thread
//! and swapping it in (see the `engine` module).

use std::path::Path;
use std::sync::Arc;

use cv_core::{Error, IrChannelConfig, IrSettings, Result, Sample};
use cv_dsp::{DelayLine, PartitionedConvolver, ProcState, TimeDomainConvolver, MAXPART, MAXSIZE};

use crate::source::{AudioData, ChanSource, Readable, SrcSource};

/// Chunk size for streaming impulse data into the core.
const IR_CHUNK: usize = 8192;

/// Real-time scheduling request for the level workers.
#[derive(Debug, Clone, Copy)]
pub struct SchedParams {
    /// Scheduling policy (e.g. `libc::SCHED_FIFO` on Linux).
    pub policy: i32,
    /// Base priority; each level applies its relative priority on top.
    pub priority: i32,
}

/// A configured convolution engine for one impulse response.
pub struct Convolver {
    path: Arc<str>,
    irc: IrChannelConfig,
    sched: SchedParams,
    settings: IrSettings,
    sample_rate: u32,
    /// Mono, engine-rate sources, one per usable IR channel.
    sources: Vec<Box<dyn Readable>>,
    conv: PartitionedConvolver,
    /// Processing quantum (power of two derived from the block size).
    n_samples: usize,
    /// IR length in frames at the engine rate.
    max_size: u64,
    /// Position within the current quantum.
    offset: usize,
    configured: bool,
    /// Time-domain tails, indexed `out * 2 + in`.
    tdc: [TimeDomainConvolver; 4],
    /// Dry-path alignment delays for the buffered mode.
    dly: [DelayLine; 2],
    dry: f32,
    wet: f32,
    dry_target: f32,
    wet_target: f32,
    /// One-pole smoothing coefficient, 2950 / rate.
    alpha: f32,
}

impl Convolver {
    /// Load an IR file and build an engine instance for it.
    ///
    /// The file is decoded in full, split into per-channel views and
    /// resampled to `sample_rate` where needed. Fails when the IR is
    /// longer than 2^24 frames or has no usable channels. The instance
    /// still needs [`reconfigure`](Self::reconfigure) before use.
    pub fn new(
        path: &str,
        sample_rate: u32,
        sched: SchedParams,
        irc: IrChannelConfig,
        settings: IrSettings,
    ) -> Result<Self> {
        let data = Arc::new(AudioData::decode_file(Path::new(path))?);
        Self::with_data(path, data, sample_rate, sched, irc, settings)
    }

    /// Build an engine instance over already-decoded audio.
    pub fn with_data(
        path: &str,
        data: Arc<AudioData>,
        sample_rate: u32,
        sched: SchedParams,
        irc: IrChannelConfig,
        settings: IrSettings,
    ) -> Result<Self> {
        if data.frames() > MAXSIZE as u64 {
            return Err(Error::IrLoad(format!(
                "IR too long: {} frames (max {})",
                data.frames(),
                MAXSIZE
            )));
        }
        if data.frames() == 0 || data.channels() == 0 {
            return Err(Error::IrLoad("no usable audio channels".into()));
        }

        let mut sources: Vec<Box<dyn Readable>> = Vec::new();
        for ch in 0..data.channels().min(4) {
            let chan = Box::new(ChanSource::new(Arc::clone(&data), ch)?);
            if chan.sample_rate() != sample_rate {
                sources.push(Box::new(SrcSource::new(chan, sample_rate)?));
            } else {
                sources.push(chan);
            }
        }

        Ok(Self {
            path: Arc::from(path),
            irc,
            sched,
            settings,
            sample_rate,
            sources,
            conv: PartitionedConvolver::new(),
            n_samples: 0,
            max_size: 0,
            offset: 0,
            configured: false,
            tdc: Default::default(),
            dly: Default::default(),
            dry: 0.0,
            wet: 1.0,
            dry_target: 0.0,
            wet_target: 1.0,
            alpha: 2950.0 / sample_rate as f32,
        })
    }

    pub fn n_inputs(&self) -> u32 {
        self.irc.n_inputs() as u32
    }

    pub fn n_outputs(&self) -> u32 {
        self.irc.n_outputs() as u32
    }

    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    pub fn settings(&self) -> &IrSettings {
        &self.settings
    }

    pub fn sum_inputs(&self) -> bool {
        self.settings.sum_inputs
    }

    /// Latency of the buffered run path, in samples.
    pub fn latency(&self) -> u32 {
        self.n_samples as u32
    }

    pub fn artificial_latency(&self) -> i32 {
        self.settings.artificial_latency
    }

    /// Engine is configured and its workers are running.
    pub fn ready(&self) -> bool {
        self.configured && self.conv.state() == ProcState::Proc
    }

    /// (Re)build the partition scheme for a host block size and start
    /// processing. Not real-time safe; runs on the worker thread.
    ///
    /// The quantum becomes the block size rounded up to a power of two,
    /// so the buffered path reports one nominal block of latency. With
    /// `threaded` set the IR tail is spread over worker-thread levels up
    /// to the maximum partition size; otherwise everything runs at the
    /// quantum size on the audio thread.
    pub fn reconfigure(&mut self, block_size: u32, threaded: bool) -> Result<()> {
        if self.conv.state() == ProcState::Proc {
            let _ = self.conv.stop_process();
        }
        self.conv.cleanup();
        self.conv.set_options(0);
        self.configured = false;

        let quantum = block_size.next_power_of_two();
        let n_part = if threaded { MAXPART } else { quantum };

        self.n_samples = quantum as usize;
        self.offset = 0;
        self.max_size = self.sources[0].len();

        // The plan must cover the IR shifted by the largest pre-delay in
        // use, or delayed impulse data would fall off the end.
        let n_imp = (self.n_inputs() * self.n_outputs()) as usize;
        let max_delay = (0..n_imp)
            .filter(|&c| self.settings.gain * self.settings.channel_gain[c] != 0.0)
            .map(|c| self.settings.predelay + self.settings.channel_predelay[c])
            .max()
            .unwrap_or(0);
        let plan_size = (self.max_size + max_delay as u64).min(MAXSIZE as u64) as u32;

        self.conv.configure(
            self.n_inputs(),
            self.n_outputs(),
            plan_size.max(1),
            quantum,
            quantum,
            n_part,
            0.0,
        )?;

        if let Err(e) = self.load_impulse_data() {
            let _ = self.conv.stop_process();
            self.conv.cleanup();
            return Err(e);
        }

        let period_ns = 1e9 * quantum as f64 / self.sample_rate as f64;
        if let Err(e) = self
            .conv
            .start_process(self.sched.priority, self.sched.policy, period_ns)
        {
            self.conv.cleanup();
            return Err(e);
        }

        self.configured = true;
        log::debug!(
            "convolver configured: {} frames, quantum {}, {} level(s)",
            self.max_size,
            quantum,
            self.conv.plan().len()
        );
        Ok(())
    }

    /// Map impulse slots onto (input, output) pairs and stream the IR
    /// channels into the core.
    ///
    /// Slot layout per channel configuration:
    /// - Mono: slot 0 = in0 -> out0.
    /// - MonoToStereo: slots 0, 1 = in0 -> out0, in0 -> out1 (a mono IR
    ///   feeds both from channel 0).
    /// - Stereo with a 1- or 2-channel IR (a 3rd channel is ignored):
    ///   slots 0, 1 = in0 -> out0, in1 -> out1, no cross-feed.
    /// - Stereo with a 4-channel IR: slots 0..4 = LL, LR, RL, RR.
    ///
    /// A slot with zero gain is skipped entirely, which downgrades a
    /// true-stereo IR to plain stereo at a fraction of the cost.
    fn load_impulse_data(&mut self) -> Result<()> {
        let n_in = self.n_inputs() as usize;
        let n_out = self.n_outputs() as usize;
        let mut n_imp = n_in * n_out;
        let mut n_chn = self.sources.len();

        if self.irc == IrChannelConfig::Stereo && n_chn == 3 {
            n_chn = 2;
        }
        if self.irc == IrChannelConfig::Stereo && n_chn <= 2 {
            n_imp = 2;
        }

        for tdc in self.tdc.iter_mut() {
            tdc.reset();
        }
        self.dly[0].reset(self.n_samples);
        self.dly[1].reset(self.n_samples);

        let mut chunk = vec![0.0; IR_CHUNK];
        for c in 0..n_imp {
            let ir_c = c % n_chn;
            let io_o = c % n_out;
            let io_i = if n_imp == 2 && self.irc == IrChannelConfig::Stereo {
                c % n_in
            } else {
                (c / n_out) % n_in
            };

            let chan_gain = self.settings.gain * self.settings.channel_gain[c];
            let chan_delay = self.settings.predelay + self.settings.channel_predelay[c];
            if chan_gain == 0.0 {
                continue;
            }

            log::debug!(
                "impulse map: IR channel {} -> in {} out {} (gain {:.3}, delay {})",
                ir_c,
                io_i,
                io_o,
                chan_gain,
                chan_delay
            );

            let source = &mut self.sources[ir_c];
            debug_assert_eq!(source.len(), self.max_size);

            let mut head = [0.0; 64];
            let got = source.read(&mut head, 0, 0);
            self.tdc[io_o * 2 + io_i].configure(&head[..got], chan_gain, chan_delay);

            let mut pos = 0u64;
            loop {
                let to_read = IR_CHUNK.min((self.max_size - pos) as usize);
                let ns = source.read(&mut chunk[..to_read], pos, 0);
                if ns == 0 {
                    break;
                }
                if chan_gain != 1.0 {
                    for s in chunk[..ns].iter_mut() {
                        *s *= chan_gain;
                    }
                }
                self.conv.impdata_create(
                    io_i as u32,
                    io_o as u32,
                    1,
                    &chunk[..ns],
                    (chan_delay as u64 + pos) as i64,
                    (chan_delay as u64 + pos + ns as u64) as i64,
                )?;
                pos += ns as u64;
                if pos == self.max_size {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Set dry/wet output gain coefficients, optionally smoothed.
    pub fn set_output_gain(&mut self, dry: f32, wet: f32, interpolate: bool) {
        self.dry_target = dry;
        self.wet_target = wet;
        if !interpolate {
            self.dry = dry;
            self.wet = wet;
        }
    }

    fn interpolate_gain(&mut self) {
        if self.dry != self.dry_target {
            self.dry += self.alpha * (self.dry_target - self.dry) + 1e-10;
            if (self.dry - self.dry_target).abs() < 1e-5 {
                self.dry = self.dry_target;
            }
        }
        if self.wet != self.wet_target {
            self.wet += self.alpha * (self.wet_target - self.wet) + 1e-10;
            if (self.wet - self.wet_target).abs() < 1e-5 {
                self.wet = self.wet_target;
            }
        }
    }

    /// Zero-latency mono run path.
    ///
    /// `buf` carries the dry input in and the mix out. Complete quanta go
    /// through the full partitioned engine; a trailing partial block is
    /// covered by the pre-computed level tails plus the time-domain head
    /// stage.
    pub fn run_mono(&mut self, buf: &mut [Sample]) {
        debug_assert!(self.ready());
        debug_assert_eq!(self.irc, IrChannelConfig::Mono);

        let q = self.n_samples;
        let mut done = 0;
        let mut remain = buf.len();

        while remain > 0 {
            let ns = remain.min(q - self.offset);
            let off = self.offset;

            self.conv.inpdata(0)[off..off + ns].copy_from_slice(&buf[done..done + ns]);

            if off + ns == q {
                self.conv.process();
                self.interpolate_gain();
                mix_output(
                    &mut buf[done..done + ns],
                    &self.conv.outdata(0)[off..off + ns],
                    self.dry,
                    self.wet,
                );
                self.offset = 0;
            } else {
                debug_assert_eq!(remain, ns);
                self.conv.tailonly(off + ns);
                self.tdc[0].run(
                    &mut self.conv.outdata_mut(0)[off..off + ns],
                    &buf[done..done + ns],
                );
                self.interpolate_gain();
                mix_output(
                    &mut buf[done..done + ns],
                    &self.conv.outdata(0)[off..off + ns],
                    self.dry,
                    self.wet,
                );
                self.offset += ns;
            }
            done += ns;
            remain -= ns;
        }
    }

    /// Zero-latency stereo (and mono-to-stereo) run path.
    pub fn run_stereo(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        debug_assert!(self.ready());
        debug_assert!(self.irc != IrChannelConfig::Mono);

        let q = self.n_samples;
        let stereo_in = self.irc == IrChannelConfig::Stereo;
        let mut done = 0;
        let mut remain = left.len().min(right.len());

        while remain > 0 {
            let ns = remain.min(q - self.offset);
            let off = self.offset;

            self.conv.inpdata(0)[off..off + ns].copy_from_slice(&left[done..done + ns]);
            if stereo_in {
                self.conv.inpdata(1)[off..off + ns].copy_from_slice(&right[done..done + ns]);
            }

            if off + ns == q {
                self.conv.process();
                self.interpolate_gain();
                mix_output(
                    &mut left[done..done + ns],
                    &self.conv.outdata(0)[off..off + ns],
                    self.dry,
                    self.wet,
                );
                mix_output(
                    &mut right[done..done + ns],
                    &self.conv.outdata(1)[off..off + ns],
                    self.dry,
                    self.wet,
                );
                self.offset = 0;
            } else {
                debug_assert_eq!(remain, ns);
                self.conv.tailonly(off + ns);

                self.tdc[0].run(
                    &mut self.conv.outdata_mut(0)[off..off + ns],
                    &left[done..done + ns],
                );
                self.tdc[1].run(
                    &mut self.conv.outdata_mut(0)[off..off + ns],
                    &right[done..done + ns],
                );
                self.tdc[2].run(
                    &mut self.conv.outdata_mut(1)[off..off + ns],
                    &left[done..done + ns],
                );
                self.tdc[3].run(
                    &mut self.conv.outdata_mut(1)[off..off + ns],
                    &right[done..done + ns],
                );

                self.interpolate_gain();
                mix_output(
                    &mut left[done..done + ns],
                    &self.conv.outdata(0)[off..off + ns],
                    self.dry,
                    self.wet,
                );
                mix_output(
                    &mut right[done..done + ns],
                    &self.conv.outdata(1)[off..off + ns],
                    self.dry,
                    self.wet,
                );
                self.offset += ns;
            }
            done += ns;
            remain -= ns;
        }
    }

    /// Buffered mono run path: one quantum of latency, dry path delayed
    /// to match.
    pub fn run_buffered_mono(&mut self, buf: &mut [Sample]) {
        debug_assert!(self.ready());
        debug_assert_eq!(self.irc, IrChannelConfig::Mono);

        let q = self.n_samples;
        let mut done = 0;
        let mut remain = buf.len();

        while remain > 0 {
            let ns = remain.min(q - self.offset);
            let off = self.offset;

            self.conv.inpdata(0)[off..off + ns].copy_from_slice(&buf[done..done + ns]);

            if self.dry == self.dry_target && self.dry == 0.0 {
                self.dly[0].clear();
            } else {
                self.dly[0].run(&mut buf[done..done + ns]);
            }

            self.interpolate_gain();
            mix_output(
                &mut buf[done..done + ns],
                &self.conv.outdata(0)[off..off + ns],
                self.dry,
                self.wet,
            );

            self.offset += ns;
            done += ns;
            remain -= ns;

            if self.offset == q {
                self.conv.process();
                self.offset = 0;
            }
        }
    }

    /// Buffered stereo run path.
    pub fn run_buffered_stereo(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        debug_assert!(self.ready());
        debug_assert!(self.irc != IrChannelConfig::Mono);

        let q = self.n_samples;
        let stereo_in = self.irc == IrChannelConfig::Stereo;
        let mut done = 0;
        let mut remain = left.len().min(right.len());

        while remain > 0 {
            let ns = remain.min(q - self.offset);
            let off = self.offset;

            self.conv.inpdata(0)[off..off + ns].copy_from_slice(&left[done..done + ns]);
            if stereo_in {
                self.conv.inpdata(1)[off..off + ns].copy_from_slice(&right[done..done + ns]);
            }

            if self.dry == self.dry_target && self.dry == 0.0 {
                self.dly[0].clear();
                self.dly[1].clear();
            } else {
                self.dly[0].run(&mut left[done..done + ns]);
                self.dly[1].run(&mut right[done..done + ns]);
            }

            self.interpolate_gain();
            mix_output(
                &mut left[done..done + ns],
                &self.conv.outdata(0)[off..off + ns],
                self.dry,
                self.wet,
            );
            mix_output(
                &mut right[done..done + ns],
                &self.conv.outdata(1)[off..off + ns],
                self.dry,
                self.wet,
            );

            self.offset += ns;
            done += ns;
            remain -= ns;

            if self.offset == q {
                self.conv.process();
                self.offset = 0;
            }
        }
    }
}

/// Mix the wet engine output over the dry signal already in `dst`.
fn mix_output(dst: &mut [Sample], src: &[Sample], dry: f32, wet: f32) {
    if dry == 0.0 && wet == 1.0 {
        dst.copy_from_slice(src);
    } else {
        for (d, &s) in dst.iter_mut().zip(src.iter()) {
            *d = dry * *d + wet * s;
        }
    }
}

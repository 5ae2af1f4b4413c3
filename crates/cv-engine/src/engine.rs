//! Online/offline engine pair and the hot-swap protocol
//!
//! Rebuilding a convolver is O(IR length) and cannot run on the audio
//! thread, so IR changes go through a worker-thread protocol:
//!
//! 1. The audio thread forwards a load request to the worker and does
//!    nothing else.
//! 2. The worker builds a fresh [`Convolver`] into the offline slot. If a
//!    build is already in flight, the request parks in a one-slot queue
//!    (last request wins). On success the worker responds `Apply`.
//! 3. The audio thread picks the response up at the head of `run`, swaps
//!    the online and offline engines (a pointer exchange under a
//!    momentarily held lock), and schedules `Free`.
//! 4. The worker drops the displaced engine and, if a request was queued
//!    meanwhile, immediately starts loading it.
//! 5. A failed build swaps nothing; the worker still drains the queue.
//!
//! The displaced engine keeps producing output until the instant of the
//! swap, so the stream never gaps. [`Engine`] is the audio-side handle,
//! [`EngineWorker`] the worker-side one; `Engine::new` creates the pair
//! in the same way the mixer hands out its control handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use cv_core::{db_to_coeff, Error, IrChannelConfig, IrSettings, Result, Sample};

use crate::convolver::{Convolver, SchedParams};

/// Host block-size bounds.
const MIN_BLOCK: u32 = 64;
const MAX_BLOCK: u32 = 8192;

/// Gain-interpolation chunk for the no-engine pass-through.
const GAIN_CHUNK: usize = 64;

/// Static configuration of an engine pair.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Nominal host block length; clamped up to 64, rejected above 8192.
    pub block_size: u32,
    pub channel_config: IrChannelConfig,
    /// Worker scheduling; a priority of 0 selects the policy midpoint.
    pub sched: SchedParams,
}

/// Control-port messages from the host.
#[derive(Debug, Clone)]
pub enum ControlMsg {
    /// Request loading a new IR file.
    SetIr(String),
    /// Request a notification with the current IR.
    Query,
}

/// Notification to the host UI.
#[derive(Debug, Clone)]
pub struct Notice {
    pub path: Arc<str>,
    /// The change came from the user rather than a state restore.
    pub dirty: bool,
}

/// Serialized engine state: the IR path plus all trim settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub ir: String,
    pub gain: f32,
    pub predelay: u32,
    pub sum_inputs: bool,
    pub channel_gain: [f32; 4],
    pub channel_predelay: [u32; 4],
    pub artificial_latency: i32,
}

impl EngineState {
    pub fn settings(&self) -> IrSettings {
        IrSettings {
            gain: self.gain,
            predelay: self.predelay,
            channel_gain: self.channel_gain,
            channel_predelay: self.channel_predelay,
            sum_inputs: self.sum_inputs,
            artificial_latency: self.artificial_latency,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("state serializes")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::IrLoad(format!("state: {}", e)))
    }
}

/// Worker commands.
enum Work {
    Load {
        path: String,
        settings: Option<IrSettings>,
        dirty: bool,
    },
    Free,
}

/// Worker-to-audio responses.
enum Response {
    Apply,
}

struct QueuedLoad {
    path: String,
    settings: Option<IrSettings>,
    dirty: bool,
}

#[derive(Default)]
struct Slots {
    offline: Option<Box<Convolver>>,
    offline_dirty: bool,
    queued: Option<QueuedLoad>,
}

struct Shared {
    slots: Mutex<Slots>,
    /// Engines actually built (diagnostics; exercised by the coalescing
    /// contract).
    loads_started: AtomicUsize,
    /// Requests parked in the one-slot queue.
    loads_queued: AtomicUsize,
}

/// Audio-side handle: owns the online engine and the host surface.
pub struct Engine {
    cfg: EngineConfig,
    online: Option<Box<Convolver>>,
    shared: Arc<Shared>,
    work_tx: Sender<Work>,
    resp_rx: Receiver<Response>,
    buffered: bool,
    db_dry: f32,
    db_wet: f32,
    dry_coeff: f32,
    dry_target: f32,
    /// One-pole smoothing coefficient for the pass-through gain.
    tc64: f32,
    latency: f32,
    notice: Option<Notice>,
}

/// Worker-side handle: executes loads and frees off the audio thread.
pub struct EngineWorker {
    cfg: EngineConfig,
    shared: Arc<Shared>,
    work_rx: Receiver<Work>,
    resp_tx: Sender<Response>,
}

impl Engine {
    /// Create an engine pair. The host drives the [`EngineWorker`] from
    /// a non-real-time thread (or calls [`EngineWorker::run`] on one).
    pub fn new(mut cfg: EngineConfig) -> Result<(Engine, EngineWorker)> {
        if cfg.block_size > MAX_BLOCK {
            return Err(Error::BadParam("block size above 8192"));
        }
        if cfg.block_size < MIN_BLOCK {
            log::info!("block size {} too small, using {}", cfg.block_size, MIN_BLOCK);
            cfg.block_size = MIN_BLOCK;
        }
        if cfg.sched.priority == 0 {
            cfg.sched.priority = default_priority(cfg.sched.policy);
            log::debug!("using default rt priority {}", cfg.sched.priority);
        }

        let shared = Arc::new(Shared {
            slots: Mutex::new(Slots::default()),
            loads_started: AtomicUsize::new(0),
            loads_queued: AtomicUsize::new(0),
        });
        let (work_tx, work_rx) = bounded(16);
        let (resp_tx, resp_rx) = bounded(2);

        let engine = Engine {
            cfg,
            online: None,
            shared: Arc::clone(&shared),
            work_tx,
            resp_rx,
            buffered: true,
            db_dry: -60.0,
            db_wet: 0.0,
            dry_coeff: 0.0,
            dry_target: 0.0,
            tc64: 2950.0 / cfg.sample_rate as f32,
            latency: 0.0,
            notice: None,
        };
        let worker = EngineWorker {
            cfg,
            shared,
            work_rx,
            resp_tx,
        };
        Ok((engine, worker))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Latency reported after the last `run`, in samples.
    pub fn latency(&self) -> f32 {
        self.latency
    }

    /// Select the buffered (one block latency) or zero-latency path.
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// Dry/wet gains in dB (≤ -60 is silence, ≥ +6.02 clamps to 2x).
    pub fn set_mix_db(&mut self, db_dry: f32, db_wet: f32) {
        if self.db_dry == db_dry && self.db_wet == db_wet {
            return;
        }
        self.db_dry = db_dry;
        self.db_wet = db_wet;
        self.dry_target = db_to_coeff(db_dry);
        if let Some(online) = self.online.as_mut() {
            online.set_output_gain(self.dry_target, db_to_coeff(db_wet), true);
            // The engine finishes the ramp; the pass-through coefficient
            // follows so a later engine drop does not jump.
            self.dry_coeff = self.dry_target;
        }
    }

    /// Handle a control-port message. Real-time safe: a load request is
    /// only forwarded to the worker.
    pub fn control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::SetIr(path) => {
                if path.is_empty() || path.len() > 1024 {
                    return;
                }
                let _ = self.work_tx.try_send(Work::Load {
                    path,
                    settings: None,
                    dirty: true,
                });
            }
            ControlMsg::Query => {
                if let Some(online) = &self.online {
                    self.notice = Some(Notice {
                        path: Arc::clone(online.path()),
                        dirty: false,
                    });
                }
            }
        }
    }

    /// Take the pending UI notification, if any.
    pub fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    /// Serialize the current state, if an engine is online.
    pub fn save(&self) -> Option<EngineState> {
        let online = self.online.as_ref()?;
        let s = online.settings();
        Some(EngineState {
            ir: online.path().to_string(),
            gain: s.gain,
            predelay: s.predelay,
            sum_inputs: s.sum_inputs,
            channel_gain: s.channel_gain,
            channel_predelay: s.channel_predelay,
            artificial_latency: s.artificial_latency,
        })
    }

    /// Re-apply the host block size after it changed. Not real-time
    /// safe: rebuilds the online engine in place.
    pub fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        if block_size > MAX_BLOCK {
            return Err(Error::BadParam("block size above 8192"));
        }
        self.cfg.block_size = block_size.max(MIN_BLOCK);
        if let Some(online) = self.online.as_mut() {
            online.reconfigure(self.cfg.block_size, true)?;
        }
        Ok(())
    }

    /// Host activation: restart the online engine's processing. Not
    /// real-time safe.
    pub fn activate(&mut self) -> Result<()> {
        if let Some(online) = self.online.as_mut() {
            online.reconfigure(self.cfg.block_size, true)?;
        }
        Ok(())
    }

    /// Process one host block.
    ///
    /// `inputs` and `outputs` carry the configured channel counts; all
    /// slices share one length `<=` the nominal block. Responses from the
    /// worker are applied first, so a pending swap takes effect at a
    /// block boundary.
    pub fn run(&mut self, inputs: &[&[Sample]], outputs: &mut [&mut [Sample]]) {
        while let Ok(resp) = self.resp_rx.try_recv() {
            self.work_response(resp);
        }

        let n_in = self.cfg.channel_config.n_inputs();
        let n_out = self.cfg.channel_config.n_outputs();
        debug_assert_eq!(inputs.len(), n_in);
        debug_assert_eq!(outputs.len(), n_out);
        let n = outputs[0].len();
        debug_assert!(n <= self.cfg.block_size.next_power_of_two() as usize);

        if self.online.is_none() {
            self.latency = 0.0;
            self.run_passthrough(inputs, outputs, n);
            return;
        }
        if !self.ready() {
            // The engine stopped itself (late-cycle limit); output
            // silence until a replacement is swapped in.
            self.latency = 0.0;
            for out in outputs.iter_mut() {
                out[..n].fill(0.0);
            }
            return;
        }

        {
            let online = self.online.as_ref().expect("online engine present");
            self.latency = online.artificial_latency() as f32
                + if self.buffered {
                    online.latency() as f32
                } else {
                    0.0
                };
        }

        outputs[0][..n].copy_from_slice(&inputs[0][..n]);
        if n_in == 2 {
            let online = self.online.as_mut().expect("online engine present");
            let (left, right) = outputs.split_at_mut(1);
            let left = &mut left[0][..n];
            let right = &mut right[0][..n];
            if online.sum_inputs() {
                // Fake stereo: both channels run the summed input.
                for (l, &i1) in left.iter_mut().zip(inputs[1][..n].iter()) {
                    *l = 0.5 * (*l + i1);
                }
                right.copy_from_slice(left);
            } else {
                right.copy_from_slice(&inputs[1][..n]);
            }
            if self.buffered {
                online.run_buffered_stereo(left, right);
            } else {
                online.run_stereo(left, right);
            }
        } else if n_out == 2 {
            let online = self.online.as_mut().expect("online engine present");
            let (left, right) = outputs.split_at_mut(1);
            let left = &mut left[0][..n];
            let right = &mut right[0][..n];
            right.copy_from_slice(&inputs[0][..n]);
            if self.buffered {
                online.run_buffered_stereo(left, right);
            } else {
                online.run_stereo(left, right);
            }
        } else {
            let online = self.online.as_mut().expect("online engine present");
            if self.buffered {
                online.run_buffered_mono(&mut outputs[0][..n]);
            } else {
                online.run_mono(&mut outputs[0][..n]);
            }
        }
    }

    /// Forward audio with the dry gain while no engine is online.
    fn run_passthrough(&mut self, inputs: &[&[Sample]], outputs: &mut [&mut [Sample]], n: usize) {
        let n_in = inputs.len();
        outputs[0][..n].copy_from_slice(&inputs[0][..n]);
        if outputs.len() == 2 {
            let src = if n_in == 2 { inputs[1] } else { inputs[0] };
            outputs[1][..n].copy_from_slice(&src[..n]);
        }

        if self.dry_coeff == self.dry_target {
            if self.dry_coeff == 1.0 {
                return;
            }
            if self.dry_coeff == 0.0 {
                for out in outputs.iter_mut() {
                    out[..n].fill(0.0);
                }
                return;
            }
            let gain = self.dry_coeff;
            for out in outputs.iter_mut() {
                for s in out[..n].iter_mut() {
                    *s *= gain;
                }
            }
            return;
        }

        // Ramp toward the target in short chunks.
        let alpha = self.tc64;
        let mut cur = self.dry_coeff;
        let tgt = self.dry_target;
        let mut done = 0;
        while done < n {
            let ns = (n - done).min(GAIN_CHUNK);
            cur += alpha * (tgt - cur) + 1e-10;
            for out in outputs.iter_mut() {
                for s in out[done..done + ns].iter_mut() {
                    *s *= cur;
                }
            }
            done += ns;
        }
        self.dry_coeff = if (cur - tgt).abs() < 1e-5 { tgt } else { cur };
    }

    /// Apply a worker response: swap the engine pair and schedule the
    /// displaced engine for destruction. Only touches pointer fields
    /// under the lock.
    fn work_response(&mut self, resp: Response) {
        let Response::Apply = resp;

        let mut slots = self.shared.slots.lock();
        if slots.offline.is_none() {
            // The build failed; a Free still drains any queued request.
            if slots.queued.is_some() {
                let _ = self.work_tx.try_send(Work::Free);
            }
            return;
        }

        std::mem::swap(&mut self.online, &mut slots.offline);
        let dirty = slots.offline_dirty;
        let queued_pending = slots.queued.is_some();
        drop(slots);

        if let Some(online) = self.online.as_mut() {
            online.set_output_gain(db_to_coeff(self.db_dry), db_to_coeff(self.db_wet), false);
            if !queued_pending {
                self.notice = Some(Notice {
                    path: Arc::clone(online.path()),
                    dirty,
                });
            }
        }

        let _ = self.work_tx.try_send(Work::Free);
    }

    /// Engines built so far (a coalesced burst of requests builds two:
    /// the first and the last).
    pub fn load_count(&self) -> usize {
        self.shared.loads_started.load(Ordering::Relaxed)
    }

    /// Requests that were parked in the one-slot queue so far.
    pub fn queued_count(&self) -> usize {
        self.shared.loads_queued.load(Ordering::Relaxed)
    }

    /// An engine is online and processing.
    pub fn ready(&self) -> bool {
        self.online.as_ref().map(|c| c.ready()).unwrap_or(false)
    }

    /// Path of the online IR, if any.
    pub fn current_ir(&self) -> Option<Arc<str>> {
        self.online.as_ref().map(|c| Arc::clone(c.path()))
    }
}

impl EngineWorker {
    /// Drain and execute work until the audio side goes away. Meant for
    /// a dedicated host worker thread.
    pub fn run(self) {
        while let Ok(work) = self.work_rx.recv() {
            self.work(work);
        }
    }

    /// Execute a single pending work item, if any. Returns whether one
    /// was handled. For hosts that pump the worker themselves.
    pub fn run_once(&self) -> bool {
        match self.work_rx.try_recv() {
            Ok(work) => {
                self.work(work);
                true
            }
            Err(_) => false,
        }
    }

    /// Restore serialized state: load the IR with its settings through
    /// the normal worker path, marked clean for the host's dirty
    /// indicator. Runs on the calling (non-real-time) thread.
    pub fn restore(&self, state: &EngineState) -> Result<()> {
        if self.load_ir(state.ir.clone(), Some(state.settings()), false) {
            Ok(())
        } else {
            Err(Error::IrLoad(format!("restore failed: {}", state.ir)))
        }
    }

    fn work(&self, work: Work) {
        match work {
            Work::Load {
                path,
                settings,
                dirty,
            } => {
                self.load_ir(path, settings, dirty);
            }
            Work::Free => self.free_offline(),
        }
    }

    /// Build a convolver into the offline slot, or park the request if a
    /// build is already in flight. Responds `Apply` on success.
    fn load_ir(&self, path: String, settings: Option<IrSettings>, dirty: bool) -> bool {
        let mut slots = self.shared.slots.lock();
        if slots.offline.is_some() {
            log::info!("build in progress, queueing IR {}", path);
            slots.queued = Some(QueuedLoad {
                path,
                settings,
                dirty,
            });
            self.shared.loads_queued.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        log::info!("loading IR {}", path);
        self.shared.loads_started.fetch_add(1, Ordering::Relaxed);

        let built = Convolver::new(
            &path,
            self.cfg.sample_rate,
            self.cfg.sched,
            self.cfg.channel_config,
            settings.unwrap_or_default(),
        )
        .and_then(|mut conv| {
            conv.reconfigure(self.cfg.block_size, true)?;
            Ok(conv)
        });

        match built {
            Ok(conv) if conv.ready() => {
                slots.offline = Some(Box::new(conv));
                slots.offline_dirty = dirty;
                drop(slots);
                let _ = self.resp_tx.try_send(Response::Apply);
                true
            }
            Ok(_) => {
                log::warn!("IR {} configured but not running", path);
                drop(slots);
                self.free_offline();
                false
            }
            Err(e) => {
                log::warn!("IR load failed: {}", e);
                drop(slots);
                self.free_offline();
                false
            }
        }
    }

    /// Destroy the displaced engine and start any queued load.
    fn free_offline(&self) {
        let queued = {
            let mut slots = self.shared.slots.lock();
            // Dropping the engine stops its workers and frees its plans;
            // that is the whole point of doing it here.
            slots.offline = None;
            slots.queued.take()
        };
        if let Some(q) = queued {
            log::info!("processing queued IR {}", q.path);
            self.load_ir(q.path, q.settings, q.dirty);
        }
    }
}

#[cfg(unix)]
fn default_priority(policy: i32) -> i32 {
    let min = unsafe { libc::sched_get_priority_min(policy) };
    let max = unsafe { libc::sched_get_priority_max(policy) };
    if min >= 0 && max > min {
        (min + max) / 2
    } else {
        0
    }
}

#[cfg(not(unix))]
fn default_priority(_policy: i32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(block_size: u32) -> EngineConfig {
        EngineConfig {
            sample_rate: 48000,
            block_size,
            channel_config: IrChannelConfig::Mono,
            sched: SchedParams {
                policy: 0,
                priority: 1,
            },
        }
    }

    #[test]
    fn test_block_size_bounds() {
        assert!(Engine::new(test_config(16384)).is_err());

        let (engine, _worker) = Engine::new(test_config(32)).unwrap();
        assert_eq!(engine.config().block_size, 64);

        let (engine, _worker) = Engine::new(test_config(1024)).unwrap();
        assert_eq!(engine.config().block_size, 1024);
    }

    #[test]
    fn test_state_json_roundtrip() {
        let state = EngineState {
            ir: "/tmp/hall.wav".into(),
            gain: 0.5,
            predelay: 120,
            sum_inputs: true,
            channel_gain: [1.0, 0.0, 0.0, 1.0],
            channel_predelay: [0, 5, 5, 0],
            artificial_latency: 256,
        };
        let json = state.to_json();
        let back = EngineState::from_json(&json).unwrap();
        assert_eq!(state, back);

        // Key names are the stable state-bag contract.
        for key in [
            "\"ir\"",
            "\"gain\"",
            "\"predelay\"",
            "\"sum_inputs\"",
            "\"channel_gain\"",
            "\"channel_predelay\"",
            "\"artificial_latency\"",
        ] {
            assert!(json.contains(key), "missing {} in {}", key, json);
        }
    }

    #[test]
    fn test_passthrough_without_engine() {
        let (mut engine, _worker) = Engine::new(test_config(128)).unwrap();
        engine.set_mix_db(0.0, 0.0);

        let input = vec![0.25f32; 128];
        let mut out = vec![0.0f32; 128];
        engine.run(&[input.as_slice()], &mut [out.as_mut_slice()]);
        assert_eq!(engine.latency(), 0.0);
        // Dry gain 0 dB forwards the signal once the ramp settles.
        let mut settled = out[127];
        for _ in 0..50 {
            engine.run(&[input.as_slice()], &mut [out.as_mut_slice()]);
            settled = out[127];
        }
        assert!((settled - 0.25).abs() < 1e-3, "settled at {}", settled);
    }

    #[test]
    fn test_run_with_zero_samples() {
        let (mut engine, _worker) = Engine::new(test_config(128)).unwrap();
        let input: Vec<Sample> = Vec::new();
        let mut out: Vec<Sample> = Vec::new();
        engine.run(&[input.as_slice()], &mut [out.as_mut_slice()]);
    }
}

//! cv-engine: IR loading, channel routing and hot-swap for Cavern
//!
//! Couples the partitioned convolution core to impulse-response sources
//! and a plug-in-style host surface:
//!
//! - [`Readable`] and its implementations decode and adapt IR audio
//!   (memory, file, per-channel views, sample-rate conversion).
//! - [`Convolver`] is one fully configured engine instance: channel
//!   routing, buffered and zero-latency run paths, dry/wet smoothing.
//! - [`Engine`] / [`EngineWorker`] hold an online/offline engine pair and
//!   implement the worker-thread hot-swap protocol, so the host can
//!   change the IR while audio keeps flowing.

mod convolver;
mod engine;
mod source;

pub use convolver::{Convolver, SchedParams};
pub use engine::{ControlMsg, Engine, EngineConfig, EngineState, EngineWorker, Notice};
pub use source::{AudioData, ChanSource, MemSource, Readable, SrcSource};

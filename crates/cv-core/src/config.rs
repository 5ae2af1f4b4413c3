//! Impulse-response configuration records
//!
//! These types describe how an impulse response is mapped onto the
//! engine's inputs and outputs, and the per-instance trim settings that
//! are applied while the IR is loaded. Both are immutable once an engine
//! instance has been built; changing them means building a replacement
//! engine and hot-swapping it in.

use serde::{Deserialize, Serialize};

/// Channel routing of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IrChannelConfig {
    /// 1 in, 1 out; 1 IR channel.
    Mono,
    /// 1 in, 2 out; IR channel 0 feeds the left output, channel 1 (or
    /// channel 0 again for a mono IR) feeds the right output.
    MonoToStereo,
    /// 2 in, 2 out. With a 1- or 2-channel IR: L->L, R->R and no
    /// cross-feed. With a 4-channel IR: L->L, L->R, R->L, R->R.
    Stereo,
}

impl IrChannelConfig {
    /// Number of engine input channels for this routing.
    #[inline]
    pub fn n_inputs(self) -> usize {
        match self {
            IrChannelConfig::Mono | IrChannelConfig::MonoToStereo => 1,
            IrChannelConfig::Stereo => 2,
        }
    }

    /// Number of engine output channels for this routing.
    #[inline]
    pub fn n_outputs(self) -> usize {
        match self {
            IrChannelConfig::Mono => 1,
            IrChannelConfig::MonoToStereo | IrChannelConfig::Stereo => 2,
        }
    }
}

/// Per-instance impulse-response trim settings.
///
/// `channel_gain` and `channel_predelay` are indexed by impulse slot
/// (up to four: L->L, L->R, R->L, R->R for true-stereo IRs). A slot whose
/// gain is exactly zero is skipped entirely when the engine is built,
/// which is how a true-stereo IR is downgraded to a cheap stereo one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrSettings {
    /// Overall gain applied to every IR channel.
    pub gain: f32,
    /// Global pre-delay in samples, added to every impulse slot.
    pub predelay: u32,
    /// Per-slot gain trim.
    pub channel_gain: [f32; 4],
    /// Per-slot pre-delay in samples.
    pub channel_predelay: [u32; 4],
    /// Sum both inputs to mono before convolving (fake-stereo mode).
    pub sum_inputs: bool,
    /// Extra latency reported to the host without delaying audio.
    pub artificial_latency: i32,
}

impl Default for IrSettings {
    fn default() -> Self {
        Self {
            gain: 1.0,
            predelay: 0,
            channel_gain: [1.0; 4],
            channel_predelay: [0; 4],
            sum_inputs: false,
            artificial_latency: 0,
        }
    }
}

//! cv-dsp: Multi-threaded partitioned convolution core
//!
//! Implements nonuniform partitioned FFT convolution for impulse responses
//! of up to 2^24 samples under hard real-time constraints. The impulse
//! response is split into levels of progressively larger partition sizes:
//! the smallest level runs synchronously on the audio thread for zero
//! added latency, while larger levels run on dedicated worker threads that
//! exchange audio with the audio thread through wait-free SPSC rings.
//!
//! The audio-thread surface is [`PartitionedConvolver`]: stage one quantum
//! of input per channel, call [`PartitionedConvolver::process`], read the
//! accumulated output. [`PartitionedConvolver::tailonly`] serves partial
//! cycles in the zero-latency path together with the short
//! [`TimeDomainConvolver`].

mod delay;
mod fft;
mod level;
mod partitioned;
mod plan;
mod rt;
mod time_domain;

pub use delay::DelayLine;
pub use partitioned::{
    PartitionedConvolver, ProcState, FL_LOAD, MAXDIVIS, MAXINP, MAXOUT, MAXPART, MAXQUANT,
    MAXSIZE, MINPART, MINQUANT, OPT_LATE_CONTIN,
};
pub use plan::{build_plan, LevelSpec, FFT_COST, MAC_COST};
pub use rt::RtParams;
pub use time_domain::TimeDomainConvolver;

//! Per-stream DSP
//!
//! Each stream owns a fixed insert: a state-variable low-pass on the melodic
//! stream (the LFO's modulation target) and a Freeverb-style reverb on the
//! rhythm stream (the stutter bloom target).

mod filter;
mod reverb;

pub use filter::StreamFilter;
pub use reverb::StreamReverb;

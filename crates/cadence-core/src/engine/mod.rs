//! Loop playback engine
//!
//! The engine is split across a render path and a control plane:
//! - `LoopEngine`: render-path core (owned by the audio callback)
//! - `EngineController`: application-facing API + scheduler thread
//! - `SwitchScheduler`: fixed-rate pending-switch promotion
//! - seam/lfo/stutter: the DSP behaviors the two planes coordinate on

mod clipper;
mod command;
mod controller;
mod engine;
pub mod gc;
mod lfo;
mod scheduler;
mod seam;
mod stream;
mod stutter;

pub use clipper::MasterClipper;
pub use command::{command_channel, event_channel, EngineCommand, RenderEvent};
pub use controller::{EngineController, DEFAULT_BPM, MAX_BPM, MIN_BPM};
pub use engine::{LoopEngine, MAX_BUFFER_SIZE};
pub use lfo::LfoModulator;
pub use scheduler::{ControlState, CurrentLoop, PendingSwitch, SwitchScheduler};
pub use seam::{classify, crossfade_gains, declick_ramp, Seam, SeamStyle};
pub use stream::{StreamPlayer, Voice};
pub use stutter::{extract_slice, find_transient, StutterSession, TransientWeights};

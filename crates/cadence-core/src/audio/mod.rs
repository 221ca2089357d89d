//! Audio output backend
//!
//! One cross-platform CPAL output stream drives the render engine and the
//! device clock. The engine itself never sees CPAL types: the callback owns
//! a `LoopEngine`, pulls buffers from it, and advances the shared frame
//! counter every other thread schedules against.

mod cpal_backend;
mod error;

pub use cpal_backend::{start_audio_system, AudioHandle, AudioSystem};
pub use error::{AudioError, AudioResult};

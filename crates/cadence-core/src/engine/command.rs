//! Lock-free rings between the control plane and the render path
//!
//! The control plane never touches engine state directly: it pushes
//! [`EngineCommand`]s into an `rtrb` ring, and the render callback pops them
//! at buffer boundaries (~50ns either side, no locks, no allocation on the
//! audio thread — loop content arrives pre-allocated behind
//! `basedrop::Shared` pointers).
//!
//! Commands that say "at frame F" are declarative: the render path holds
//! them until F falls inside the current buffer and applies them at the
//! exact sample offset. The reverse direction is a second ring of small
//! [`RenderEvent`]s recording when scheduled operations actually sounded.

use basedrop::Shared;

use super::seam::SeamStyle;
use super::stutter::StutterSession;
use crate::clock::Transport;
use crate::loops::{LoopBuffer, LoopId};
use crate::types::StreamId;

/// Simultaneous dual-stream switch payload
///
/// Boxed in the command enum: it carries two loop pointers plus the shared
/// boundary, which would otherwise bloat every command slot.
pub struct DualSwitchOp {
    pub rhythm: Shared<LoopBuffer>,
    pub melodic: Shared<LoopBuffer>,
    /// Shared boundary frame, valid for both loops (LCM boundary if needed)
    pub at_frame: u64,
    /// De-click ramp length in frames
    pub ramp_frames: u64,
}

/// Commands sent from the control plane to the render path
pub enum EngineCommand {
    /// Install the transport (start/BPM reference) for beat-locked DSP
    SetTransport(Transport),
    /// Drop the transport (playback stopped)
    ClearTransport,
    /// Begin looping `content` on the stream's active voice at an exact frame
    StartVoice {
        stream: StreamId,
        content: Shared<LoopBuffer>,
        at_frame: u64,
    },
    /// Run the standby voice silently to absorb device warm-up latency
    PrimeStandby { stream: StreamId },
    /// Swap the stream to `content` at an exact frame, seam-shaped;
    /// flips active/standby on completion
    SwitchLoop {
        stream: StreamId,
        content: Shared<LoopBuffer>,
        style: SeamStyle,
        at_frame: u64,
        /// Seam envelope length in frames
        seam_frames: u64,
    },
    /// Atomic both-streams hard-cut-in-place at a shared boundary (no flip)
    DualSwitch(Box<DualSwitchOp>),
    /// Halt both streams, clear all scheduled work and any stutter session
    StopAll,
    /// Filter cutoff target for a stream (doubles as the LFO max endpoint)
    SetFilterCutoff { stream: StreamId, hz: f32 },
    /// Reverb wet baseline for a stream
    SetReverbMix { stream: StreamId, mix: f32 },
    /// Arm the LFO at a whole-beat boundary, or begin its release ramp
    SetLfoEnabled { enabled: bool, arm_beat: f64 },
    /// Install a fully-planned stutter session
    StartStutter(Box<StutterSession>),
    /// End the stutter on its grid boundary, pre-faded
    ReleaseStutter { at_frame: u64, fade_frames: u64 },
}

/// Events sent back from the render path to the control plane
///
/// Small and `Copy`: these cross a lock-free ring written inside the audio
/// callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderEvent {
    /// A switch became audible at exactly this frame
    SwitchAudible {
        stream: StreamId,
        loop_id: LoopId,
        at_frame: u64,
        /// False for the dual in-place path
        flipped: bool,
    },
    /// The stutter pulse train started
    StutterBegan { at_frame: u64 },
    /// The stutter ended on its boundary
    StutterEnded { at_frame: u64 },
}

/// Capacity of the command ring
///
/// A burst is at most a handful of commands per tick (transport + two
/// switches + effect targets); 256 is generous headroom.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the render event ring
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Create the control-to-render command ring
pub fn command_channel() -> (rtrb::Producer<EngineCommand>, rtrb::Consumer<EngineCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

/// Create the render-to-control event ring
pub fn event_channel() -> (rtrb::Producer<RenderEvent>, rtrb::Consumer<RenderEvent>) {
    rtrb::RingBuffer::new(EVENT_QUEUE_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_channel_roundtrip() {
        let (mut tx, mut rx) = command_channel();

        tx.push(EngineCommand::StopAll).unwrap();
        assert!(matches!(rx.pop().unwrap(), EngineCommand::StopAll));
        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_command_size() {
        // Commands live in a lock-free ring; keep them within a cache line.
        // Large payloads (DualSwitchOp, StutterSession) must stay boxed.
        let size = std::mem::size_of::<EngineCommand>();
        assert!(size <= 64, "EngineCommand is {} bytes, expected <= 64", size);
    }

    #[test]
    fn test_render_event_size() {
        let size = std::mem::size_of::<RenderEvent>();
        assert!(size <= 48, "RenderEvent is {} bytes, expected <= 48", size);
    }
}

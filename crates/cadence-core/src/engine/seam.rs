//! Seam policy: how one loop's audio hands over to another's
//!
//! Continuation-like content (a direct temporal follow-on of what is already
//! playing) crossfades with an equal-power curve so perceived loudness stays
//! constant through the seam. Unrelated content hard-cuts: the incoming
//! buffer starts at full volume on the boundary, de-clicked by a short
//! cosine ramp, while the outgoing voice stops at the same frame.

use crate::loops::LoopMetadata;

/// How a switch transitions between outgoing and incoming audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeamStyle {
    /// Equal-power crossfade over a short window
    Crossfade,
    /// Instant cut with a few-millisecond de-click fade-in
    HardCut,
}

/// Classify incoming content from its metadata
pub fn classify(metadata: &LoopMetadata) -> SeamStyle {
    if metadata.is_continuation() {
        SeamStyle::Crossfade
    } else {
        SeamStyle::HardCut
    }
}

/// Equal-power crossfade gains at progress `x` in [0, 1]
///
/// Returns `(gain_in, gain_out)` with `gain_in^2 + gain_out^2 == 1` exactly
/// (sin/cos identity), so the summed energy never dips or bumps mid-fade.
#[inline]
pub fn crossfade_gains(x: f64) -> (f32, f32) {
    let x = x.clamp(0.0, 1.0);
    let angle = std::f64::consts::FRAC_PI_2 * x;
    (angle.sin() as f32, angle.cos() as f32)
}

/// Cosine 0 -> 1 de-click ramp at progress `x` in [0, 1]
#[inline]
pub fn declick_ramp(x: f64) -> f32 {
    let x = x.clamp(0.0, 1.0);
    (0.5 - 0.5 * (std::f64::consts::PI * x).cos()) as f32
}

/// An in-flight seam on one stream, evaluated per sample by the render path
#[derive(Debug, Clone, Copy)]
pub struct Seam {
    pub style: SeamStyle,
    /// Device frame at which the seam begins (the switch boundary)
    pub start_frame: u64,
    /// Envelope length in frames (crossfade window or de-click ramp)
    pub duration_frames: u64,
}

impl Seam {
    /// Gains for (incoming, outgoing) voices at an absolute device frame
    #[inline]
    pub fn gains_at(&self, frame: u64) -> (f32, f32) {
        if frame < self.start_frame {
            return (0.0, 1.0);
        }
        let elapsed = frame - self.start_frame;
        if elapsed >= self.duration_frames {
            return (1.0, 0.0);
        }
        let x = elapsed as f64 / self.duration_frames as f64;
        match self.style {
            SeamStyle::Crossfade => crossfade_gains(x),
            // Outgoing is already cut at the boundary; only the incoming ramps
            SeamStyle::HardCut => (declick_ramp(x), 0.0),
        }
    }

    /// Whether the seam has fully resolved at this frame
    #[inline]
    pub fn is_complete(&self, frame: u64) -> bool {
        frame >= self.start_frame + self.duration_frames
    }
}

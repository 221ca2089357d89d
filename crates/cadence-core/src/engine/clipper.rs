//! Master safety clipper
//!
//! ClipOnly2-style stateful clipper (after the Airwindows algorithm by Chris
//! Johnson) on the summed output: overlapping seams and stutter pulses can
//! momentarily exceed full scale, and a plain `clamp` there is audible. Uses
//! the Dottie number (fixed point of cos(x) = x) as the interpolation ratio
//! for smooth clip entry and exit. Pure bypass below the threshold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::StereoBuffer;

/// Dottie number: the unique fixed point of cos(x) = x
const HARDNESS: f32 = 0.739_085_13;
const SOFTNESS: f32 = 1.0 - HARDNESS;

pub struct MasterClipper {
    /// Clip threshold in linear amplitude
    threshold: f32,
    thresh_hard: f32,
    thresh_soft: f32,

    // Per-channel state (0 = left, 1 = right)
    last_sample: [f32; 2],
    was_pos_clip: [bool; 2],
    was_neg_clip: [bool; 2],

    /// Set when clipping occurs; pollers read and clear
    clip_active: Arc<AtomicBool>,
    clipped_this_buffer: bool,
}

impl MasterClipper {
    /// Clipper with the default threshold of -0.3 dBFS
    pub fn new() -> Self {
        Self::with_threshold_db(-0.3)
    }

    pub fn with_threshold_db(db: f32) -> Self {
        let threshold = 10.0_f32.powf(db / 20.0);
        Self {
            threshold,
            thresh_hard: threshold * HARDNESS,
            thresh_soft: threshold * SOFTNESS,
            last_sample: [0.0; 2],
            was_pos_clip: [false; 2],
            was_neg_clip: [false; 2],
            clip_active: Arc::new(AtomicBool::new(false)),
            clipped_this_buffer: false,
        }
    }

    /// Shared clip indicator
    pub fn clip_indicator(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.clip_active)
    }

    /// Process a stereo buffer in-place
    pub fn process(&mut self, buffer: &mut StereoBuffer) {
        self.clipped_this_buffer = false;
        for sample in buffer.iter_mut() {
            sample.left = self.process_sample(sample.left, 0);
            sample.right = self.process_sample(sample.right, 1);
        }
        if self.clipped_this_buffer {
            self.clip_active.store(true, Ordering::Relaxed);
        }
    }

    #[inline]
    fn process_sample(&mut self, input: f32, ch: usize) -> f32 {
        let mut sample = input.clamp(-4.0, 4.0);

        if self.was_pos_clip[ch] {
            if sample < self.last_sample[ch] {
                self.last_sample[ch] = self.thresh_hard + sample * SOFTNESS;
            } else {
                self.last_sample[ch] = self.thresh_soft + self.last_sample[ch] * HARDNESS;
            }
        }
        self.was_pos_clip[ch] = false;
        if sample > self.threshold {
            self.was_pos_clip[ch] = true;
            sample = self.thresh_hard + self.last_sample[ch] * SOFTNESS;
            self.clipped_this_buffer = true;
        }

        if self.was_neg_clip[ch] {
            if sample > self.last_sample[ch] {
                self.last_sample[ch] = -self.thresh_hard + sample * SOFTNESS;
            } else {
                self.last_sample[ch] = -self.thresh_soft + self.last_sample[ch] * HARDNESS;
            }
        }
        self.was_neg_clip[ch] = false;
        if sample < -self.threshold {
            self.was_neg_clip[ch] = true;
            sample = -self.thresh_hard + self.last_sample[ch] * SOFTNESS;
            self.clipped_this_buffer = true;
        }

        let out = self.last_sample[ch];
        self.last_sample[ch] = sample;
        out
    }

    pub fn reset(&mut self) {
        self.last_sample = [0.0; 2];
        self.was_pos_clip = [false; 2];
        self.was_neg_clip = [false; 2];
    }
}

impl Default for MasterClipper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    #[test]
    fn test_below_threshold_passthrough() {
        let mut clipper = MasterClipper::new();
        let mut buffer = StereoBuffer::silence(64);
        for s in buffer.iter_mut() {
            *s = StereoSample::mono(0.5);
        }
        clipper.process(&mut buffer);

        // One sample of state latency, then clean passthrough
        assert_eq!(buffer[10].left, 0.5);
        assert!(!clipper.clip_indicator().load(Ordering::Relaxed));
    }

    #[test]
    fn test_overs_bounded_and_flagged() {
        let mut clipper = MasterClipper::new();
        let mut buffer = StereoBuffer::silence(256);
        for s in buffer.iter_mut() {
            *s = StereoSample::mono(1.8);
        }
        clipper.process(&mut buffer);

        let threshold = 10.0f32.powf(-0.3 / 20.0);
        for (i, s) in buffer.iter().enumerate().skip(1) {
            assert!(
                s.left.abs() <= threshold + 1e-3,
                "sample {} not clipped: {}",
                i,
                s.left
            );
        }
        assert!(clipper.clip_indicator().load(Ordering::Relaxed));
    }
}

//! Stutter engine: transient-aware sub-beat slice repetition
//!
//! Engaging the stutter picks a strong transient near the next sub-beat grid
//! boundary inside the rhythm loop, extracts a slice of exactly one grid
//! duration, and pre-schedules a train of one-shot repetitions spaced one
//! grid apart. The real rhythm voice is silenced or ducked for the duration,
//! and the rhythm reverb's wet mix blooms upward over the first pulses.
//!
//! All planning (analysis, slice copy, schedule math) happens on the control
//! plane; the render path receives a finished [`StutterSession`] and only
//! indexes into it.

use basedrop::{Handle, Shared};

use crate::clock::Transport;
use crate::config::{StutterConfig, StutterDuck, StutterFocus};
use crate::loops::LoopBuffer;
use crate::types::{Sample, StereoBuffer, StereoSample};

/// Frames scored per candidate position
const ANALYSIS_WINDOW: usize = 256;

/// Candidate stride within the search window
const SEARCH_STEP: usize = 32;

/// Moving-average length for the low-frequency onset measure
const LF_SMOOTH: usize = 16;

/// Scoring weights for the transient blend
#[derive(Debug, Clone, Copy)]
pub struct TransientWeights {
    /// Short-time energy (any loud content)
    pub energy: f32,
    /// First-difference energy (high-frequency bias, snare-like)
    pub snare: f32,
    /// Moving-average energy (low-frequency bias, kick-like)
    pub kick: f32,
}

impl TransientWeights {
    pub fn for_focus(focus: StutterFocus) -> Self {
        match focus {
            StutterFocus::Kick => Self { energy: 0.4, snare: 0.1, kick: 0.5 },
            StutterFocus::Snare => Self { energy: 0.4, snare: 0.5, kick: 0.1 },
            StutterFocus::Auto => Self { energy: 0.5, snare: 0.25, kick: 0.25 },
        }
    }
}

/// RMS over a window starting at `start`, wrapping around the loop
fn short_time_energy(samples: &[StereoSample], start: usize, window: usize) -> f32 {
    let len = samples.len();
    let mut acc = 0.0f32;
    for i in 0..window {
        let s = samples[(start + i) % len].mono_sum();
        acc += s * s;
    }
    (acc / window as f32).sqrt()
}

/// First-difference energy: emphasizes sharp, bright onsets
fn hf_onset(samples: &[StereoSample], start: usize, window: usize) -> f32 {
    let len = samples.len();
    let mut acc = 0.0f32;
    let mut prev = samples[start % len].mono_sum();
    for i in 1..window {
        let s = samples[(start + i) % len].mono_sum();
        let d = s - prev;
        acc += d * d;
        prev = s;
    }
    (acc / window as f32).sqrt()
}

/// Short moving-average energy: emphasizes sustained low-frequency punch
fn lf_onset(samples: &[StereoSample], start: usize, window: usize) -> f32 {
    let len = samples.len();
    let mut acc = 0.0f32;
    let mut avg = 0.0f32;
    for i in 0..window {
        let s = samples[(start + i) % len].mono_sum();
        avg += (s - avg) / LF_SMOOTH as f32;
        acc += avg * avg;
    }
    (acc / window as f32).sqrt()
}

/// Blended transient score at a position
fn score_at(samples: &[StereoSample], start: usize, weights: &TransientWeights) -> f32 {
    weights.energy * short_time_energy(samples, start, ANALYSIS_WINDOW)
        + weights.snare * hf_onset(samples, start, ANALYSIS_WINDOW)
        + weights.kick * lf_onset(samples, start, ANALYSIS_WINDOW)
}

/// Find the strongest transient near `center` (frames into the loop)
///
/// Scans `center ± window_frames`. If the best candidate's plain energy is
/// below `floor` (stuttering near-silence would just amplify noise), falls
/// back to scanning the entire loop for its single loudest point.
pub fn find_transient(
    lp: &LoopBuffer,
    center: usize,
    window_frames: usize,
    weights: &TransientWeights,
    floor: f32,
) -> usize {
    let samples = lp.samples().as_slice();
    let len = samples.len();

    let mut best_pos = center % len;
    let mut best_score = f32::MIN;

    let span = 2 * window_frames;
    let first = (center + len).saturating_sub(window_frames); // wrapped start
    let mut offset = 0;
    while offset <= span {
        let pos = (first + offset) % len;
        let score = score_at(samples, pos, weights);
        if score > best_score {
            best_score = score;
            best_pos = pos;
        }
        offset += SEARCH_STEP;
    }

    if short_time_energy(samples, best_pos, ANALYSIS_WINDOW) >= floor {
        return best_pos;
    }

    // Local window is effectively silent: take the loudest point anywhere
    log::debug!(
        "stutter: local window below floor, scanning whole loop ({} frames)",
        len
    );
    let mut pos = 0;
    while pos < len {
        let score = score_at(samples, pos, weights);
        if score > best_score {
            best_score = score;
            best_pos = pos;
        }
        pos += ANALYSIS_WINDOW;
    }
    best_pos
}

/// Copy exactly `len_frames` out of the loop starting at `start`, wrapping
/// past the loop end if needed, with a short fade-in against clicks
pub fn extract_slice(lp: &LoopBuffer, start: usize, len_frames: usize, fade_frames: usize) -> StereoBuffer {
    let mut out = StereoBuffer::silence(len_frames);
    for i in 0..len_frames {
        out[i] = lp.sample_wrapped(start + i);
    }

    let fade = fade_frames.min(len_frames);
    for i in 0..fade {
        let gain = i as Sample / fade as Sample;
        out[i] *= gain;
    }
    out
}

/// Smoothstep ease for the reverb bloom ramp
#[inline]
fn ease(x: f32) -> f32 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

/// End-of-session marker installed by the release command
#[derive(Debug, Clone, Copy)]
pub struct StutterRelease {
    /// Grid boundary frame at which the effect ends
    pub at_frame: u64,
    /// Pre-fade length ending exactly at `at_frame`
    pub fade_frames: u64,
}

/// A fully-planned stutter session, executed sample-by-sample on the render path
pub struct StutterSession {
    /// The extracted slice; length == pulse spacing
    slice: Shared<StereoBuffer>,
    /// Device frame of the first pulse (the engage grid boundary)
    start_frame: u64,
    /// Grid duration in frames
    pulse_spacing: u64,
    /// Pulses pre-scheduled on engage
    max_pulses: usize,
    /// Gain applied to the real rhythm voice while the session runs
    duck_gain: f32,
    /// Reverb wet before the session (restored on release)
    base_wet: f32,
    /// Wet level the bloom approaches
    bloom_wet: f32,
    /// Pulses over which the bloom ramp runs
    bloom_pulses: usize,
    /// Installed by `ReleaseStutter`
    release: Option<StutterRelease>,
}

impl StutterSession {
    /// Plan a session from the playing rhythm loop
    ///
    /// `anchor_frame` is the device frame at which the loop's phase 0 fell
    /// (its start or last switch boundary). Returns `None` when a working
    /// slice cannot be produced; the engage is abandoned and playback is
    /// untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn plan(
        gc: &Handle,
        lp: &LoopBuffer,
        transport: &Transport,
        cfg: &StutterConfig,
        now_frame: u64,
        anchor_frame: u64,
        base_wet: f32,
    ) -> Option<StutterSession> {
        let frames_per_beat = transport.frames_per_beat();
        let pulse_spacing = (cfg.grid_beats * frames_per_beat).round() as u64;
        if pulse_spacing == 0 || lp.frame_len() == 0 {
            return None;
        }

        // Next grid boundary strictly after now
        let current_beat = transport.beat_at_frame(now_frame);
        let mut boundary_beat = (current_beat / cfg.grid_beats).floor() * cfg.grid_beats;
        while transport.frame_for_beat(boundary_beat) <= now_frame {
            boundary_beat += cfg.grid_beats;
        }
        let start_frame = transport.frame_for_beat(boundary_beat);

        // Where that boundary falls inside the loop
        let in_loop = if start_frame >= anchor_frame {
            ((start_frame - anchor_frame) as usize) % lp.frame_len()
        } else {
            0
        };

        let weights = TransientWeights::for_focus(cfg.focus);
        let window_frames =
            (cfg.search_window_seconds * transport.sample_rate as f64).round() as usize;
        let transient = find_transient(lp, in_loop, window_frames, &weights, cfg.loudness_floor);

        let fade_frames =
            (cfg.slice_fade_seconds * transport.sample_rate as f64).round() as usize;
        let slice = extract_slice(lp, transient, pulse_spacing as usize, fade_frames);

        let duck_gain = match cfg.duck {
            StutterDuck::Replace => 0.0,
            StutterDuck::Duck(gain) => gain.clamp(0.0, 1.0),
        };

        log::info!(
            "stutter: planned {} pulses of {} frames from loop offset {} (boundary beat {:.2})",
            cfg.max_pulses,
            pulse_spacing,
            transient,
            boundary_beat
        );

        Some(StutterSession {
            slice: Shared::new(gc, slice),
            start_frame,
            pulse_spacing,
            max_pulses: cfg.max_pulses,
            duck_gain,
            base_wet,
            bloom_wet: cfg.bloom_wet,
            bloom_pulses: cfg.bloom_pulses.max(1),
            release: None,
        })
    }

    #[inline]
    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    #[inline]
    pub fn pulse_spacing(&self) -> u64 {
        self.pulse_spacing
    }

    #[inline]
    pub fn duck_gain(&self) -> f32 {
        self.duck_gain
    }

    #[inline]
    pub fn release(&self) -> Option<StutterRelease> {
        self.release
    }

    /// Install the release boundary (idempotent; first release wins)
    pub fn set_release(&mut self, at_frame: u64, fade_frames: u64) {
        if self.release.is_none() {
            // The pre-fade must land well inside one pulse
            let fade = fade_frames.min(self.pulse_spacing / 4).max(1);
            self.release = Some(StutterRelease {
                at_frame,
                fade_frames: fade,
            });
        }
    }

    /// Pulse index sounding at an absolute frame, if any
    #[inline]
    pub fn pulse_index(&self, frame: u64) -> Option<usize> {
        if frame < self.start_frame {
            return None;
        }
        let idx = ((frame - self.start_frame) / self.pulse_spacing) as usize;
        (idx < self.max_pulses).then_some(idx)
    }

    /// Whether the session has fully ended at this frame
    #[inline]
    pub fn is_finished(&self, frame: u64) -> bool {
        if let Some(release) = self.release {
            return frame >= release.at_frame;
        }
        self.pulse_index(frame).is_none() && frame >= self.start_frame
    }

    /// Stutter voice output at an absolute frame (pre-fade applied)
    #[inline]
    pub fn sample_at(&self, frame: u64) -> StereoSample {
        if frame < self.start_frame {
            return StereoSample::silence();
        }
        if let Some(release) = self.release {
            if frame >= release.at_frame {
                return StereoSample::silence();
            }
        }
        let offset = frame - self.start_frame;
        if (offset / self.pulse_spacing) as usize >= self.max_pulses {
            return StereoSample::silence();
        }

        let mut sample = self.slice[(offset % self.pulse_spacing) as usize];

        // Pre-fade to silence so the boundary cut lands at zero
        if let Some(release) = self.release {
            let fade_start = release.at_frame.saturating_sub(release.fade_frames);
            if frame >= fade_start {
                let x = (release.at_frame - frame) as f32 / release.fade_frames as f32;
                sample *= x;
            }
        }
        sample
    }

    /// Reverb wet target while the given pulse sounds (eased bloom ramp)
    #[inline]
    pub fn wet_at_pulse(&self, pulse: usize) -> f32 {
        let x = pulse as f32 / self.bloom_pulses as f32;
        self.base_wet + (self.bloom_wet - self.base_wet) * ease(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::gc_handle;
    use crate::loops::LoopMetadata;
    use crate::types::StreamId;

    fn test_loop(frames: usize, spike_at: Option<usize>) -> LoopBuffer {
        let mut samples = vec![StereoSample::mono(0.001); frames];
        if let Some(at) = spike_at {
            for i in 0..400.min(frames - at) {
                samples[at + i] = StereoSample::mono(0.9 * (1.0 - i as f32 / 400.0));
            }
        }
        LoopBuffer::new(
            StreamId::Rhythm,
            StereoBuffer::from_vec(samples),
            48_000,
            &LoopMetadata::empty().with("beats", 16),
        )
        .unwrap()
    }

    #[test]
    fn test_find_transient_prefers_spike() {
        let lp = test_loop(48_000, Some(10_000));
        let weights = TransientWeights::for_focus(StutterFocus::Auto);

        let pos = find_transient(&lp, 10_500, 2000, &weights, 0.0);
        assert!(
            (9_500..=10_200).contains(&pos),
            "expected transient near 10000, got {}",
            pos
        );
    }

    #[test]
    fn test_find_transient_floor_fallback() {
        // Spike far outside the search window; window content is near-silent
        let lp = test_loop(48_000, Some(40_000));
        let weights = TransientWeights::for_focus(StutterFocus::Auto);

        let pos = find_transient(&lp, 5_000, 1000, &weights, 0.02);
        assert!(
            (39_000..=41_000).contains(&pos),
            "expected whole-loop fallback to find 40000, got {}",
            pos
        );
    }

    #[test]
    fn test_extract_slice_exact_length_with_wrap() {
        let lp = test_loop(1000, None);
        // Start near the loop end so the slice must wrap
        let slice = extract_slice(&lp, 900, 480, 0);
        assert_eq!(slice.len(), 480);

        let slice = extract_slice(&lp, 0, 1480, 0);
        assert_eq!(slice.len(), 1480);
    }

    #[test]
    fn test_slice_fade_in() {
        let lp = test_loop(1000, Some(0));
        let slice = extract_slice(&lp, 0, 480, 48);
        assert_eq!(slice[0].left, 0.0);
        assert!(slice[24].left.abs() < slice[100].left.abs());
    }

    #[test]
    fn test_plan_pulses_on_grid() {
        // BPM=100, grid 0.25 beats -> spacing = 0.15s = 7200 frames
        let lp = test_loop(48_000 * 4, Some(1000));
        let transport = Transport::new(0, 100.0, 48_000);
        let cfg = StutterConfig::default();

        // Engage mid-loop at frame 10_000 (beat ~0.347)
        let session = StutterSession::plan(
            &gc_handle(),
            &lp,
            &transport,
            &cfg,
            10_000,
            0,
            0.1,
        )
        .unwrap();

        assert_eq!(session.pulse_spacing(), 7_200);
        // First pulse on the next 0.25-beat boundary (beat 0.5 = frame 14400),
        // never immediately
        assert_eq!(session.start_frame(), 14_400);
        assert!(session.start_frame() > 10_000);
    }

    #[test]
    fn test_session_pulse_train_and_release() {
        let lp = test_loop(48_000, Some(0));
        let transport = Transport::new(0, 120.0, 48_000);
        let cfg = StutterConfig::default();

        let mut session =
            StutterSession::plan(&gc_handle(), &lp, &transport, &cfg, 0, 0, 0.1).unwrap();
        let spacing = session.pulse_spacing();
        let start = session.start_frame();

        assert_eq!(session.pulse_index(start), Some(0));
        assert_eq!(session.pulse_index(start + spacing), Some(1));
        assert_eq!(session.pulse_index(start.wrapping_sub(1)), None);

        // Release on the third boundary; fade capped to a quarter pulse
        session.set_release(start + 3 * spacing, spacing);
        let release = session.release().unwrap();
        assert!(release.fade_frames <= spacing / 4);

        assert!(!session.is_finished(start + 3 * spacing - 1));
        assert!(session.is_finished(start + 3 * spacing));
        assert_eq!(
            session.sample_at(start + 3 * spacing),
            StereoSample::silence()
        );

        // Pre-fade takes hold just before the boundary
        let pre = session.sample_at(start + 3 * spacing - 1);
        assert!(pre.peak() < 0.05);
    }

    #[test]
    fn test_bloom_ramp_monotonic_and_bounded() {
        let lp = test_loop(48_000, Some(0));
        let transport = Transport::new(0, 120.0, 48_000);
        let cfg = StutterConfig::default();

        let session =
            StutterSession::plan(&gc_handle(), &lp, &transport, &cfg, 0, 0, 0.1).unwrap();

        let mut last = 0.0f32;
        for pulse in 0..cfg.bloom_pulses + 4 {
            let wet = session.wet_at_pulse(pulse);
            assert!(wet >= last - 1e-6);
            assert!(wet <= cfg.bloom_wet + 1e-6);
            last = wet;
        }
        assert_eq!(session.wet_at_pulse(0), 0.1);
        assert!((session.wet_at_pulse(cfg.bloom_pulses) - cfg.bloom_wet).abs() < 1e-6);
    }
}

//! Device-time clock and beat-grid conversions
//!
//! All scheduling decisions in the engine are made on the output device's own
//! timeline: a frame counter advanced by the render callback. Wall-clock time
//! is never consulted, so beat math stays sample-accurate regardless of
//! system clock drift or callback jitter.
//!
//! The clock is injectable: [`DeviceClock`] is fed by the real render path,
//! [`VirtualClock`] is set explicitly by tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic time source on the audio device's timeline
///
/// `now_frames` returns `None` when the device clock is momentarily
/// unreadable (stream not yet running, device lost). Callers never block on
/// that: they fall back to `last_known_frames() + fixed short lead`.
pub trait Clock: Send + Sync {
    /// Current device time in frames, if the device clock is readable
    fn now_frames(&self) -> Option<u64>;

    /// Last frame count observed, readable even while the clock is down
    fn last_known_frames(&self) -> u64;

    /// Sample rate of the device timeline
    fn sample_rate(&self) -> u32;

    /// Current device time in frames, falling back to
    /// `last_known + fallback_lead_seconds` when the clock is unreadable
    fn now_or_fallback(&self, fallback_lead_seconds: f64) -> u64 {
        self.now_frames().unwrap_or_else(|| {
            self.last_known_frames() + seconds_to_frames(fallback_lead_seconds, self.sample_rate())
        })
    }

    /// Device frame `seconds` from now (with the same fallback rule)
    fn frames_from_now(&self, seconds: f64, fallback_lead_seconds: f64) -> u64 {
        self.now_or_fallback(fallback_lead_seconds) + seconds_to_frames(seconds, self.sample_rate())
    }
}

/// Convert seconds to frames at the given rate (rounded)
#[inline]
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    (seconds.max(0.0) * sample_rate as f64).round() as u64
}

/// Convert frames to seconds at the given rate
#[inline]
pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    frames as f64 / sample_rate as f64
}

/// Clock backed by the real output device
///
/// The render callback bumps the frame counter once per buffer; every other
/// thread reads it with relaxed loads. `running` drops to false when the
/// stream dies, which switches readers onto the fallback path.
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    sample_rate: u32,
}

impl DeviceClock {
    /// Create a device clock for the given sample rate
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            sample_rate,
        }
    }

    /// Handle the render callback uses to advance the clock
    pub fn writer(&self) -> DeviceClockWriter {
        DeviceClockWriter {
            frames: Arc::clone(&self.frames),
            running: Arc::clone(&self.running),
        }
    }
}

impl Clock for DeviceClock {
    fn now_frames(&self) -> Option<u64> {
        if self.running.load(Ordering::Relaxed) {
            Some(self.frames.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn last_known_frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Render-side writer for a [`DeviceClock`]
#[derive(Clone)]
pub struct DeviceClockWriter {
    frames: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl DeviceClockWriter {
    /// Mark the clock alive and advance it by one rendered buffer
    #[inline]
    pub fn advance(&self, buffer_frames: u64) {
        self.frames.fetch_add(buffer_frames, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);
    }

    /// Mark the clock unreadable (stream stopped or lost)
    pub fn mark_down(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Current frame count as seen by the writer
    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Deterministic clock for tests
pub struct VirtualClock {
    frames: AtomicU64,
    available: AtomicBool,
    sample_rate: u32,
}

impl VirtualClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            available: AtomicBool::new(true),
            sample_rate,
        }
    }

    /// Jump to an absolute frame position
    pub fn set_frames(&self, frames: u64) {
        self.frames.store(frames, Ordering::Relaxed);
    }

    /// Advance by the given number of seconds
    pub fn advance_seconds(&self, seconds: f64) {
        self.frames.fetch_add(
            seconds_to_frames(seconds, self.sample_rate),
            Ordering::Relaxed,
        );
    }

    /// Simulate the device clock dropping out
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl Clock for VirtualClock {
    fn now_frames(&self) -> Option<u64> {
        if self.available.load(Ordering::Relaxed) {
            Some(self.frames.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn last_known_frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Playback transport: start reference frame + BPM
///
/// Created when playback starts, cleared when it stops. BPM never changes
/// while a transport exists, so every conversion below is a pure function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    /// Device frame at which beat 0 falls
    pub start_frame: u64,
    /// Beats per minute, fixed for the lifetime of this transport
    pub bpm: f64,
    /// Sample rate of the device timeline
    pub sample_rate: u32,
}

impl Transport {
    pub fn new(start_frame: u64, bpm: f64, sample_rate: u32) -> Self {
        Self {
            start_frame,
            bpm,
            sample_rate,
        }
    }

    /// Frames in one beat at this tempo
    #[inline]
    pub fn frames_per_beat(&self) -> f64 {
        self.sample_rate as f64 * 60.0 / self.bpm
    }

    /// Continuous beat position at a device frame, clamped to >= 0
    #[inline]
    pub fn beat_at_frame(&self, frame: u64) -> f64 {
        if frame <= self.start_frame {
            0.0
        } else {
            (frame - self.start_frame) as f64 / self.frames_per_beat()
        }
    }

    /// Device frame at which a beat position falls
    #[inline]
    pub fn frame_for_beat(&self, beat: f64) -> u64 {
        self.start_frame + (beat.max(0.0) * self.frames_per_beat()).round() as u64
    }

    /// Smallest beat >= the beat at `frame` that is an integer multiple of
    /// `loop_beats` — the next time a loop of that length completes a cycle
    pub fn next_loop_boundary_beat(&self, frame: u64, loop_beats: f64) -> f64 {
        debug_assert!(loop_beats > 0.0);
        let current = self.beat_at_frame(frame);
        // Tolerate being a hair past a boundary due to frame rounding
        let cycles = (current / loop_beats - 1e-9).ceil().max(0.0);
        cycles * loop_beats
    }
}

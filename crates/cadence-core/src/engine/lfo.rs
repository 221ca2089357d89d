//! Phase-locked filter sweep for the melodic stream
//!
//! The sweep value is a pure function of the transport's beat position —
//! never an incremented counter — so it can't drift against the grid. The
//! shape is a gate-like "rounded square": a hold at the minimum, a fast
//! smoothstep rise, a hold at the maximum, and a smoothstep fall, which is
//! C1-continuous at every segment edge.
//!
//! Enabling arms the sweep at the next whole-beat boundary so phase 0 lands
//! on a downbeat. Disabling never snaps: the output ramps back to the user's
//! cutoff target over a short fixed release. The "max" endpoint follows the
//! user target through an exponential smoother so live knob movement doesn't
//! step mid-sweep.

use crate::clock::Transport;
use crate::config::LfoConfig;

/// Smoothstep: zero derivative at both ends
#[inline]
fn smoothstep(x: f64) -> f64 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LfoState {
    Off,
    /// Sweep begins at this whole-beat boundary
    Armed { from_beat: f64 },
    /// Ramping from the sweep's last value back to the user target
    Releasing { from_hz: f32, start_frame: u64 },
}

/// The melodic filter's cutoff driver
///
/// Owns the cutoff outright: with the sweep off it outputs the (smoothed)
/// user target, so the filter always has exactly one writer.
pub struct LfoModulator {
    cfg: LfoConfig,
    sample_rate: u32,
    state: LfoState,
    /// User cutoff target; doubles as the sweep's max endpoint
    target_hz: f32,
    /// Exponentially smoothed view of `target_hz`
    smoothed_max: f32,
    /// Last emitted value, the release ramp's starting point
    last_output: f32,
}

impl LfoModulator {
    pub fn new(cfg: LfoConfig, sample_rate: u32, initial_cutoff: f32) -> Self {
        Self {
            cfg,
            sample_rate,
            state: LfoState::Off,
            target_hz: initial_cutoff,
            smoothed_max: initial_cutoff,
            last_output: initial_cutoff,
        }
    }

    /// Set the user cutoff target (and the sweep's max endpoint)
    pub fn set_target(&mut self, hz: f32) {
        self.target_hz = hz;
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target_hz
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.state, LfoState::Armed { .. })
    }

    /// Arm the sweep to begin at the given whole-beat boundary
    pub fn enable(&mut self, arm_beat: f64) {
        self.state = LfoState::Armed {
            from_beat: arm_beat,
        };
        log::debug!("lfo: armed from beat {}", arm_beat);
    }

    /// Begin the release ramp back to the user target
    pub fn disable(&mut self, now_frame: u64) {
        if matches!(self.state, LfoState::Armed { .. }) {
            self.state = LfoState::Releasing {
                from_hz: self.last_output,
                start_frame: now_frame,
            };
        }
    }

    /// Drop all sweep state immediately (transport stopped)
    pub fn reset(&mut self) {
        self.state = LfoState::Off;
        self.smoothed_max = self.target_hz;
        self.last_output = self.target_hz;
    }

    /// Shape value in [0, 1] for a phase in [0, 1)
    fn shape(&self, phase: f64) -> f64 {
        let low = self.cfg.low_hold_fraction;
        let rise = self.cfg.rise_fraction;
        let high = self.cfg.high_hold_fraction;
        let fall = (1.0 - low - rise - high).max(1e-6);

        if phase < low {
            0.0
        } else if phase < low + rise {
            smoothstep((phase - low) / rise)
        } else if phase < low + rise + high {
            1.0
        } else {
            1.0 - smoothstep((phase - low - rise - high) / fall)
        }
    }

    /// Compute the cutoff for the buffer starting at `frame`
    ///
    /// Called once per render buffer; `buffer_frames` sets the smoother step.
    pub fn evaluate(&mut self, transport: Option<&Transport>, frame: u64, buffer_frames: u64) -> f32 {
        // Track the max endpoint regardless of state
        let dt = buffer_frames as f32 / self.sample_rate as f32;
        let alpha = 1.0 - (-dt / self.cfg.target_smoothing_seconds).exp();
        self.smoothed_max += (self.target_hz - self.smoothed_max) * alpha;

        let out = match (self.state, transport) {
            (LfoState::Armed { from_beat }, Some(t)) => {
                let beat = t.beat_at_frame(frame);
                if beat < from_beat {
                    // Not yet at the downbeat: hold the user target
                    self.target_hz
                } else {
                    let phase = ((beat - from_beat) / self.cfg.cycle_beats).fract();
                    // The sweep ceiling is the smoothed user endpoint, hard-capped
                    // at the configured max
                    let ceiling = self
                        .smoothed_max
                        .min(self.cfg.max_hz)
                        .max(self.cfg.min_hz);
                    let span = ceiling - self.cfg.min_hz;
                    let value = self.cfg.min_hz + span * self.shape(phase) as f32;
                    value.clamp(self.cfg.min_hz, ceiling)
                }
            }
            (LfoState::Releasing { from_hz, start_frame }, _) => {
                let release_frames =
                    (self.cfg.release_seconds * self.sample_rate as f32) as u64;
                let elapsed = frame.saturating_sub(start_frame);
                if elapsed >= release_frames {
                    self.state = LfoState::Off;
                    self.target_hz
                } else {
                    let x = elapsed as f32 / release_frames as f32;
                    from_hz + (self.target_hz - from_hz) * x
                }
            }
            // Off, or armed with no transport: follow the user target
            _ => self.target_hz,
        };

        self.last_output = out;
        out
    }
}

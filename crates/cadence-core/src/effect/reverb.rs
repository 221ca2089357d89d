//! Reverb insert for the rhythm stream
//!
//! Freeverb-style: parallel comb filters into serial allpasses. The wet mix
//! is the one live parameter — the user sets a baseline and the stutter
//! bloom sweeps it — so it passes through a short one-pole smoother to keep
//! ramps free of zipper noise.

use crate::types::StereoBuffer;

/// Comb filter delay line lengths (in samples at 44.1kHz)
/// Prime-ish numbers to avoid resonances
const COMB_LENGTHS: [usize; 8] = [1557, 1617, 1491, 1422, 1277, 1356, 1188, 1116];

/// Allpass filter delay line lengths
const ALLPASS_LENGTHS: [usize; 4] = [225, 556, 441, 341];

/// Stereo spread offset for right channel (in samples)
const STEREO_SPREAD: usize = 23;

/// Wet-mix smoothing time constant in seconds
const MIX_SMOOTHING: f32 = 0.01;

struct CombFilter {
    buffer: Vec<f32>,
    pos: usize,
    filter_state: f32,
}

impl CombFilter {
    fn new(length: usize, sr_scale: f32) -> Self {
        let scaled_len = ((length as f32 * sr_scale) as usize).max(1);
        Self {
            buffer: vec![0.0; scaled_len],
            pos: 0,
            filter_state: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let output = self.buffer[self.pos];

        // One-pole lowpass for damping high frequencies
        self.filter_state = output * (1.0 - damp) + self.filter_state * damp;

        self.buffer[self.pos] = input + self.filter_state * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();

        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.filter_state = 0.0;
    }
}

struct AllpassFilter {
    buffer: Vec<f32>,
    pos: usize,
}

impl AllpassFilter {
    fn new(length: usize, sr_scale: f32) -> Self {
        let scaled_len = ((length as f32 * sr_scale) as usize).max(1);
        Self {
            buffer: vec![0.0; scaled_len],
            pos: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32) -> f32 {
        let buffered = self.buffer[self.pos];
        let output = -input + buffered;
        self.buffer[self.pos] = input + buffered * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
    }
}

/// Freeverb-style stereo reverb with a settable wet mix
pub struct StreamReverb {
    combs_l: Vec<CombFilter>,
    combs_r: Vec<CombFilter>,
    allpass_l: Vec<AllpassFilter>,
    allpass_r: Vec<AllpassFilter>,
    feedback: f32,
    damp: f32,
    mix_target: f32,
    mix_current: f32,
    mix_alpha: f32,
}

impl StreamReverb {
    pub fn new(sample_rate: u32) -> Self {
        let sr_scale = sample_rate as f32 / 44_100.0;

        let combs_l: Vec<_> = COMB_LENGTHS
            .iter()
            .map(|&len| CombFilter::new(len, sr_scale))
            .collect();
        let combs_r: Vec<_> = COMB_LENGTHS
            .iter()
            .map(|&len| CombFilter::new(len + STEREO_SPREAD, sr_scale))
            .collect();
        let allpass_l: Vec<_> = ALLPASS_LENGTHS
            .iter()
            .map(|&len| AllpassFilter::new(len, sr_scale))
            .collect();
        let allpass_r: Vec<_> = ALLPASS_LENGTHS
            .iter()
            .map(|&len| AllpassFilter::new(len + STEREO_SPREAD, sr_scale))
            .collect();

        // Per-sample one-pole coefficient for the mix smoother
        let mix_alpha = 1.0 - (-1.0 / (MIX_SMOOTHING * sample_rate as f32)).exp();

        Self {
            combs_l,
            combs_r,
            allpass_l,
            allpass_r,
            feedback: 0.84,
            damp: 0.4,
            mix_target: 0.0,
            mix_current: 0.0,
            mix_alpha,
        }
    }

    /// Set the wet mix target (0 = dry, 1 = fully wet)
    pub fn set_mix(&mut self, mix: f32) {
        self.mix_target = mix.clamp(0.0, 1.0);
    }

    #[inline]
    pub fn mix(&self) -> f32 {
        self.mix_target
    }

    pub fn process(&mut self, buffer: &mut StereoBuffer) {
        // Fully dry and settled: skip the tank entirely
        if self.mix_target == 0.0 && self.mix_current < 1e-4 {
            self.mix_current = 0.0;
            return;
        }

        const ALLPASS_FEEDBACK: f32 = 0.5;
        const COMB_GAIN: f32 = 0.2;

        for sample in buffer.iter_mut() {
            self.mix_current += (self.mix_target - self.mix_current) * self.mix_alpha;
            let wet = self.mix_current;
            let dry = 1.0 - wet;

            let input = sample.mono_sum();

            let mut out_l = 0.0f32;
            let mut out_r = 0.0f32;
            for comb in &mut self.combs_l {
                out_l += comb.process(input, self.feedback, self.damp);
            }
            for comb in &mut self.combs_r {
                out_r += comb.process(input, self.feedback, self.damp);
            }
            out_l *= COMB_GAIN;
            out_r *= COMB_GAIN;

            for ap in &mut self.allpass_l {
                out_l = ap.process(out_l, ALLPASS_FEEDBACK);
            }
            for ap in &mut self.allpass_r {
                out_r = ap.process(out_r, ALLPASS_FEEDBACK);
            }

            sample.left = sample.left * dry + out_l * wet;
            sample.right = sample.right * dry + out_r * wet;
        }
    }

    pub fn reset(&mut self) {
        for comb in &mut self.combs_l {
            comb.reset();
        }
        for comb in &mut self.combs_r {
            comb.reset();
        }
        for ap in &mut self.allpass_l {
            ap.reset();
        }
        for ap in &mut self.allpass_r {
            ap.reset();
        }
        self.mix_current = self.mix_target;
    }
}

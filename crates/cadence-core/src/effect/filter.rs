//! Low-pass filter for the melodic stream

use crate::types::StereoBuffer;

/// Two-pole (12dB/octave) state-variable filter
struct SvfFilter {
    // State per channel
    ic1eq_l: f32,
    ic2eq_l: f32,
    ic1eq_r: f32,
    ic2eq_r: f32,
    // Coefficients
    g: f32,
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    sample_rate: f32,
}

impl SvfFilter {
    fn new(sample_rate: u32) -> Self {
        let mut f = Self {
            ic1eq_l: 0.0,
            ic2eq_l: 0.0,
            ic1eq_r: 0.0,
            ic2eq_r: 0.0,
            g: 0.0,
            k: 0.0,
            a1: 0.0,
            a2: 0.0,
            a3: 0.0,
            sample_rate: sample_rate as f32,
        };
        f.set_params(20_000.0, 0.707);
        f
    }

    fn set_params(&mut self, cutoff: f32, q: f32) {
        let cutoff = cutoff.clamp(20.0, self.sample_rate * 0.45);
        let q = q.clamp(0.1, 10.0);

        self.g = (std::f32::consts::PI * cutoff / self.sample_rate).tan();
        self.k = 1.0 / q;
        self.a1 = 1.0 / (1.0 + self.g * (self.g + self.k));
        self.a2 = self.g * self.a1;
        self.a3 = self.g * self.a2;
    }

    /// Process one frame, returning the low-pass output
    #[inline]
    fn process_lp(&mut self, left: f32, right: f32) -> (f32, f32) {
        let v3_l = left - self.ic2eq_l;
        let v1_l = self.a1 * self.ic1eq_l + self.a2 * v3_l;
        let v2_l = self.ic2eq_l + self.a2 * self.ic1eq_l + self.a3 * v3_l;
        self.ic1eq_l = 2.0 * v1_l - self.ic1eq_l;
        self.ic2eq_l = 2.0 * v2_l - self.ic2eq_l;

        let v3_r = right - self.ic2eq_r;
        let v1_r = self.a1 * self.ic1eq_r + self.a2 * v3_r;
        let v2_r = self.ic2eq_r + self.a2 * self.ic1eq_r + self.a3 * v3_r;
        self.ic1eq_r = 2.0 * v1_r - self.ic1eq_r;
        self.ic2eq_r = 2.0 * v2_r - self.ic2eq_r;

        (v2_l, v2_r)
    }

    fn reset(&mut self) {
        self.ic1eq_l = 0.0;
        self.ic2eq_l = 0.0;
        self.ic1eq_r = 0.0;
        self.ic2eq_r = 0.0;
    }
}

/// Sweepable low-pass insert
///
/// The cutoff is written per render buffer, either by the LFO sweep or by a
/// direct user target; smoothing of the target lives with the writer, the
/// filter itself just tracks what it's told.
pub struct StreamFilter {
    filter: SvfFilter,
    cutoff_hz: f32,
    max_cutoff_hz: f32,
}

impl StreamFilter {
    pub fn new(sample_rate: u32) -> Self {
        let max_cutoff_hz = sample_rate as f32 * 0.45;
        Self {
            filter: SvfFilter::new(sample_rate),
            cutoff_hz: max_cutoff_hz,
            max_cutoff_hz,
        }
    }

    /// Set the cutoff for subsequent buffers
    pub fn set_cutoff(&mut self, hz: f32) {
        self.cutoff_hz = hz.clamp(20.0, self.max_cutoff_hz);
    }

    #[inline]
    pub fn cutoff(&self) -> f32 {
        self.cutoff_hz
    }

    /// Cutoff at which the filter is effectively transparent
    #[inline]
    pub fn open_cutoff(&self) -> f32 {
        self.max_cutoff_hz
    }

    pub fn process(&mut self, buffer: &mut StereoBuffer) {
        // Fully open: pass through untouched
        if self.cutoff_hz >= self.max_cutoff_hz {
            return;
        }

        self.filter.set_params(self.cutoff_hz, 0.707);
        for sample in buffer.iter_mut() {
            let (l, r) = self.filter.process_lp(sample.left, sample.right);
            sample.left = l;
            sample.right = r;
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    #[test]
    fn test_open_filter_passthrough() {
        let mut filter = StreamFilter::new(48_000);

        let mut buffer = StereoBuffer::silence(64);
        for s in buffer.iter_mut() {
            *s = StereoSample::new(1.0, -1.0);
        }
        filter.process(&mut buffer);

        assert_eq!(buffer[32].left, 1.0);
        assert_eq!(buffer[32].right, -1.0);
    }

    #[test]
    fn test_lowpass_attenuates_nyquist() {
        let mut filter = StreamFilter::new(48_000);
        filter.set_cutoff(200.0);

        // Alternating +1/-1 = Nyquist-rate content
        let mut buffer = StereoBuffer::silence(256);
        for (i, s) in buffer.iter_mut().enumerate() {
            let val = if i % 2 == 0 { 1.0 } else { -1.0 };
            *s = StereoSample::new(val, val);
        }
        filter.process(&mut buffer);

        let avg: f32 = buffer.iter().map(|s| s.left.abs()).sum::<f32>() / buffer.len() as f32;
        assert!(avg < 0.1, "LP at 200Hz should kill Nyquist content, avg={}", avg);
    }

    #[test]
    fn test_cutoff_clamped() {
        let mut filter = StreamFilter::new(48_000);
        filter.set_cutoff(1.0);
        assert_eq!(filter.cutoff(), 20.0);
        filter.set_cutoff(96_000.0);
        assert_eq!(filter.cutoff(), filter.open_cutoff());
    }
}

//! Dual-buffer stream player
//!
//! Each stream owns exactly two voices, "A" and "B". One is active (audible,
//! looping); the other is standby — idle, primed, or being faded in by an
//! in-flight seam. The designation is an index into the voice array and
//! flips in a single assignment when a seam completes; the dual in-place
//! path replaces content on the active voice and never flips.

use basedrop::Shared;

use super::command::RenderEvent;
use super::seam::{Seam, SeamStyle};
use crate::effect::{StreamFilter, StreamReverb};
use crate::loops::{LoopBuffer, LoopId};
use crate::types::{StereoBuffer, StereoSample, StreamId};

/// A playback slot bound to the stream's mixer channel
///
/// Holds zero or one loop. Playback is declarative: content plus the device
/// frame its phase 0 falls on. Sampling before that frame yields silence, so
/// "start at future time T" needs no timer.
pub struct Voice {
    content: Option<Shared<LoopBuffer>>,
    /// Device frame of the content's phase 0
    start_frame: u64,
    /// Loop forever vs. play once
    looping: bool,
    /// Voice gain (1.0 unless primed)
    gain: f32,
    playing: bool,
}

impl Voice {
    fn idle() -> Self {
        Self {
            content: None,
            start_frame: 0,
            looping: true,
            gain: 1.0,
            playing: false,
        }
    }

    fn assign(&mut self, content: Shared<LoopBuffer>, start_frame: u64) {
        self.content = Some(content);
        self.start_frame = start_frame;
        self.looping = true;
        self.gain = 1.0;
        self.playing = true;
    }

    /// Run silently against no content to absorb device warm-up
    fn prime(&mut self) {
        self.content = None;
        self.gain = 0.0;
        self.playing = true;
    }

    fn stop(&mut self) {
        *self = Self::idle();
    }

    #[inline]
    fn sample_at(&self, frame: u64) -> StereoSample {
        if !self.playing || frame < self.start_frame {
            return StereoSample::silence();
        }
        let Some(content) = &self.content else {
            return StereoSample::silence();
        };
        let offset = (frame - self.start_frame) as usize;
        if self.looping {
            content.sample_wrapped(offset) * self.gain
        } else if offset < content.frame_len() {
            content.samples()[offset] * self.gain
        } else {
            StereoSample::silence()
        }
    }

    pub fn loop_id(&self) -> Option<LoopId> {
        self.content.as_ref().map(|c| c.id())
    }
}

/// An in-flight switch on one stream
struct ActiveSeam {
    seam: Seam,
    /// Voice index receiving the incoming content
    incoming: usize,
    /// Whether completion flips active/standby (false for in-place)
    flip: bool,
    incoming_id: LoopId,
    /// Emitted once, when the boundary frame is first rendered
    reported: bool,
}

/// One stream's playback state on the render path
pub struct StreamPlayer {
    id: StreamId,
    voices: [Voice; 2],
    /// Index of the active voice
    active: usize,
    seam: Option<ActiveSeam>,
    filter: StreamFilter,
    reverb: StreamReverb,
}

impl StreamPlayer {
    pub fn new(id: StreamId, sample_rate: u32) -> Self {
        Self {
            id,
            voices: [Voice::idle(), Voice::idle()],
            active: 0,
            seam: None,
            filter: StreamFilter::new(sample_rate),
            reverb: StreamReverb::new(sample_rate),
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn filter_mut(&mut self) -> &mut StreamFilter {
        &mut self.filter
    }

    pub fn reverb_mut(&mut self) -> &mut StreamReverb {
        &mut self.reverb
    }

    /// Identity of the audible loop (the active voice's content)
    pub fn current_loop_id(&self) -> Option<LoopId> {
        self.voices[self.active].loop_id()
    }

    pub fn has_content(&self) -> bool {
        self.voices[self.active].content.is_some()
    }

    /// Begin looping content on the active voice at an exact frame
    pub fn start_content(&mut self, content: Shared<LoopBuffer>, at_frame: u64) {
        log::debug!(
            "{}: start loop {:?} at frame {}",
            self.id.name(),
            content.id(),
            at_frame
        );
        self.voices[self.active].assign(content, at_frame);
        self.seam = None;
    }

    /// Run the standby voice silently (first-start device warm-up)
    pub fn prime_standby(&mut self) {
        let standby = 1 - self.active;
        self.voices[standby].prime();
    }

    /// Begin a seam-shaped switch onto the standby voice
    pub fn begin_switch(
        &mut self,
        content: Shared<LoopBuffer>,
        style: SeamStyle,
        at_frame: u64,
        seam_frames: u64,
    ) {
        let standby = 1 - self.active;
        let incoming_id = content.id();
        self.voices[standby].assign(content, at_frame);
        self.seam = Some(ActiveSeam {
            seam: Seam {
                style,
                start_frame: at_frame,
                duration_frames: seam_frames.max(1),
            },
            incoming: standby,
            flip: true,
            incoming_id,
            reported: false,
        });
    }

    /// Replace the active voice's content in place (dual-switch path, no flip)
    pub fn replace_in_place(&mut self, content: Shared<LoopBuffer>, at_frame: u64, ramp_frames: u64) {
        let incoming_id = content.id();
        self.voices[self.active].assign(content, at_frame);
        self.seam = Some(ActiveSeam {
            seam: Seam {
                style: SeamStyle::HardCut,
                start_frame: at_frame,
                duration_frames: ramp_frames.max(1),
            },
            incoming: self.active,
            flip: false,
            incoming_id,
            reported: false,
        });
    }

    /// Halt both voices and drop all in-flight state
    pub fn stop(&mut self) {
        self.voices[0].stop();
        self.voices[1].stop();
        self.active = 0;
        self.seam = None;
        self.filter.reset();
        self.reverb.reset();
    }

    /// Raw voice sample at a frame, seam gains applied
    #[inline]
    fn mix_at(&self, frame: u64) -> StereoSample {
        match &self.seam {
            Some(active_seam) => {
                let (gain_in, gain_out) = active_seam.seam.gains_at(frame);
                let incoming = self.voices[active_seam.incoming].sample_at(frame) * gain_in;
                if active_seam.flip {
                    let outgoing_idx = 1 - active_seam.incoming;
                    incoming + self.voices[outgoing_idx].sample_at(frame) * gain_out
                } else {
                    // In-place: the old content is already gone
                    incoming
                }
            }
            None => self.voices[self.active].sample_at(frame),
        }
    }

    /// Fill `buffer` with this stream's voices for frames starting at
    /// `start_frame`; returns the switch-audible event if a seam boundary
    /// was crossed inside this buffer
    pub fn render_voices(&mut self, buffer: &mut StereoBuffer, start_frame: u64) -> Option<RenderEvent> {
        for (i, sample) in buffer.iter_mut().enumerate() {
            *sample = self.mix_at(start_frame + i as u64);
        }

        let end_frame = start_frame + buffer.len() as u64;
        let mut event = None;

        if let Some(active_seam) = &mut self.seam {
            // Report the boundary the first time we render past it
            if !active_seam.reported && end_frame > active_seam.seam.start_frame {
                active_seam.reported = true;
                event = Some(RenderEvent::SwitchAudible {
                    stream: self.id,
                    loop_id: active_seam.incoming_id,
                    at_frame: active_seam.seam.start_frame,
                    flipped: active_seam.flip,
                });
            }

            if active_seam.seam.is_complete(end_frame) {
                let incoming = active_seam.incoming;
                let flip = active_seam.flip;
                self.seam = None;
                if flip {
                    let outgoing = 1 - incoming;
                    self.voices[outgoing].stop();
                    self.active = incoming;
                }
            }
        }

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::gc_handle;
    use crate::loops::LoopMetadata;

    fn make_loop(value: f32, frames: usize) -> Shared<LoopBuffer> {
        let lp = LoopBuffer::new(
            StreamId::Rhythm,
            StereoBuffer::from_vec(vec![StereoSample::mono(value); frames]),
            48_000,
            &LoopMetadata::empty().with("beats", 4),
        )
        .unwrap();
        Shared::new(&gc_handle(), lp)
    }

    fn render(player: &mut StreamPlayer, start: u64, frames: usize) -> (StereoBuffer, Option<RenderEvent>) {
        let mut buffer = StereoBuffer::silence(frames);
        let event = player.render_voices(&mut buffer, start);
        (buffer, event)
    }

    #[test]
    fn test_voice_silent_before_start_frame() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(0.5, 1000), 100);

        let (buffer, _) = render(&mut player, 0, 200);
        assert_eq!(buffer[99], StereoSample::silence());
        assert_eq!(buffer[100].left, 0.5);
    }

    #[test]
    fn test_looping_wraps() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(0.5, 64), 0);

        let (buffer, _) = render(&mut player, 0, 200);
        assert_eq!(buffer[199].left, 0.5);
    }

    #[test]
    fn test_hard_cut_switch_flips_active() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(0.5, 1000), 0);
        let old_id = player.current_loop_id().unwrap();

        let incoming = make_loop(-0.5, 1000);
        let new_id = incoming.id();
        player.begin_switch(incoming, SeamStyle::HardCut, 512, 192);

        let (buffer, event) = render(&mut player, 0, 1024);

        // Old content up to the boundary, new (ramping) content after
        assert_eq!(buffer[511].left, 0.5);
        assert!(buffer[513].left <= 0.0, "outgoing must be cut at the boundary");

        match event {
            Some(RenderEvent::SwitchAudible { loop_id, at_frame, flipped, .. }) => {
                assert_eq!(loop_id, new_id);
                assert_eq!(at_frame, 512);
                assert!(flipped);
            }
            other => panic!("expected SwitchAudible, got {:?}", other),
        }

        assert_ne!(player.current_loop_id(), Some(old_id));
        assert_eq!(player.current_loop_id(), Some(new_id));
    }

    #[test]
    fn test_hard_cut_no_simultaneous_nonzero_gains() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(1.0, 4096), 0);
        player.begin_switch(make_loop(1.0, 4096), SeamStyle::HardCut, 1000, 192);

        let (buffer, _) = render(&mut player, 0, 2048);

        // At no frame do both sources contribute: |sample| never exceeds
        // a single voice's output
        for (i, s) in buffer.iter().enumerate() {
            assert!(s.left <= 1.0 + 1e-6, "summed gain > 1 at frame {}", i);
        }
    }

    #[test]
    fn test_crossfade_energy_constant() {
        let mut player = StreamPlayer::new(StreamId::Melodic, 48_000);
        player.start_content(make_loop(1.0, 8192), 0);
        player.begin_switch(make_loop(1.0, 8192), SeamStyle::Crossfade, 1000, 1200);

        let (buffer, _) = render(&mut player, 0, 4096);

        // Both sources are DC 1.0; with equal-power gains the squared sum of
        // the two gains is 1, so the mixed amplitude stays within [1, sqrt(2)]
        // and, more tightly, gain_in^2+gain_out^2 == 1 throughout the fade
        for i in 1000..2200 {
            let x = (i - 1000) as f64 / 1200.0;
            let (gain_in, gain_out) = crate::engine::seam::crossfade_gains(x);
            let expected = gain_in + gain_out;
            assert!(
                (buffer[i].left - expected).abs() < 1e-3,
                "frame {}: {} vs {}",
                i,
                buffer[i].left,
                expected
            );
            let energy = gain_in * gain_in + gain_out * gain_out;
            assert!((energy - 1.0).abs() < 0.01);
        }
    }

    #[test]
    fn test_in_place_replace_keeps_designation() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(0.5, 1000), 0);

        player.replace_in_place(make_loop(-0.5, 1000), 256, 96);
        let (_, event) = render(&mut player, 0, 1024);

        match event {
            Some(RenderEvent::SwitchAudible { flipped, .. }) => assert!(!flipped),
            other => panic!("expected SwitchAudible, got {:?}", other),
        }
        assert_eq!(player.active, 0);
    }

    #[test]
    fn test_primed_standby_inaudible() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(0.5, 1000), 0);
        player.prime_standby();

        let (buffer, _) = render(&mut player, 0, 512);
        for s in buffer.iter() {
            assert_eq!(s.left, 0.5);
        }
    }

    #[test]
    fn test_stop_clears_everything() {
        let mut player = StreamPlayer::new(StreamId::Rhythm, 48_000);
        player.start_content(make_loop(0.5, 1000), 0);
        player.begin_switch(make_loop(1.0, 1000), SeamStyle::Crossfade, 512, 256);

        player.stop();

        assert!(!player.has_content());
        assert!(player.seam.is_none());
        let (buffer, event) = render(&mut player, 0, 256);
        assert!(event.is_none());
        assert_eq!(buffer.peak(), 0.0);
    }
}

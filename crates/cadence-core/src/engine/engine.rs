//! Render-path core: executes scheduled operations sample-accurately
//!
//! `LoopEngine` is owned exclusively by the audio callback. Each buffer it
//! pops pending commands from the lock-free ring, renders both stream
//! players (applying any in-flight seams at their exact frames), mixes the
//! stutter voice, drives the LFO into the melodic filter, runs the
//! per-stream inserts, and reports what actually sounded back through the
//! event ring.

use crate::config::EngineConfig;
use crate::clock::Transport;
use crate::types::{StereoBuffer, StreamId, NUM_STREAMS};

use super::clipper::MasterClipper;
use super::command::{EngineCommand, RenderEvent};
use super::lfo::LfoModulator;
use super::stream::StreamPlayer;
use super::stutter::StutterSession;

/// Maximum buffer size to pre-allocate for real-time safety
/// Covers all common device configurations (64 .. 4096 frames)
pub const MAX_BUFFER_SIZE: usize = 8192;

/// The render-path engine
pub struct LoopEngine {
    streams: [StreamPlayer; NUM_STREAMS],
    transport: Option<Transport>,
    lfo: LfoModulator,
    stutter: Option<Box<StutterSession>>,
    /// Set once the stutter's first pulse has been reported
    stutter_began: bool,
    clipper: MasterClipper,
    commands: rtrb::Consumer<EngineCommand>,
    events: rtrb::Producer<RenderEvent>,
    /// Pre-allocated per-stream buffers
    stream_buffers: [StereoBuffer; NUM_STREAMS],
    /// Reverb wet baselines per stream (restored when a stutter ends)
    reverb_baseline: [f32; NUM_STREAMS],
    /// Device frames rendered so far; the engine's own timeline
    frame: u64,
    sample_rate: u32,
}

impl LoopEngine {
    pub fn new(
        config: &EngineConfig,
        sample_rate: u32,
        commands: rtrb::Consumer<EngineCommand>,
        events: rtrb::Producer<RenderEvent>,
    ) -> Self {
        let open = sample_rate as f32 * 0.45;
        Self {
            streams: [
                StreamPlayer::new(StreamId::Rhythm, sample_rate),
                StreamPlayer::new(StreamId::Melodic, sample_rate),
            ],
            transport: None,
            lfo: LfoModulator::new(config.lfo.clone(), sample_rate, open),
            stutter: None,
            stutter_began: false,
            clipper: MasterClipper::new(),
            commands,
            events,
            stream_buffers: std::array::from_fn(|_| StereoBuffer::silence(MAX_BUFFER_SIZE)),
            reverb_baseline: [0.0; NUM_STREAMS],
            frame: 0,
            sample_rate,
        }
    }

    /// Device frames rendered so far
    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn push_event(&mut self, event: RenderEvent) {
        // A full ring only costs the control plane a notification; never block
        let _ = self.events.push(event);
    }

    fn apply_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SetTransport(t) => self.transport = Some(t),
            EngineCommand::ClearTransport => self.transport = None,
            EngineCommand::StartVoice {
                stream,
                content,
                at_frame,
            } => self.streams[stream as usize].start_content(content, at_frame),
            EngineCommand::PrimeStandby { stream } => {
                self.streams[stream as usize].prime_standby()
            }
            EngineCommand::SwitchLoop {
                stream,
                content,
                style,
                at_frame,
                seam_frames,
            } => self.streams[stream as usize].begin_switch(content, style, at_frame, seam_frames),
            EngineCommand::DualSwitch(op) => {
                // One command, one frame: both streams change together
                let super::command::DualSwitchOp {
                    rhythm,
                    melodic,
                    at_frame,
                    ramp_frames,
                } = *op;
                self.streams[StreamId::Rhythm as usize]
                    .replace_in_place(rhythm, at_frame, ramp_frames);
                self.streams[StreamId::Melodic as usize]
                    .replace_in_place(melodic, at_frame, ramp_frames);
            }
            EngineCommand::StopAll => self.stop_all(),
            EngineCommand::SetFilterCutoff { stream, hz } => match stream {
                // The melodic cutoff is LFO-owned; user writes set its target
                StreamId::Melodic => self.lfo.set_target(hz),
                StreamId::Rhythm => self.streams[stream as usize].filter_mut().set_cutoff(hz),
            },
            EngineCommand::SetReverbMix { stream, mix } => {
                self.reverb_baseline[stream as usize] = mix;
                self.streams[stream as usize].reverb_mut().set_mix(mix);
            }
            EngineCommand::SetLfoEnabled { enabled, arm_beat } => {
                if enabled {
                    self.lfo.enable(arm_beat);
                } else {
                    self.lfo.disable(self.frame);
                }
            }
            EngineCommand::StartStutter(session) => {
                self.stutter = Some(session);
                self.stutter_began = false;
            }
            EngineCommand::ReleaseStutter {
                at_frame,
                fade_frames,
            } => {
                if let Some(session) = &mut self.stutter {
                    session.set_release(at_frame, fade_frames);
                }
            }
        }
    }

    fn stop_all(&mut self) {
        for stream in &mut self.streams {
            stream.stop();
        }
        // A stopped transport has no obligations to scheduled future events
        self.stutter = None;
        self.stutter_began = false;
        self.lfo.reset();
        self.clipper.reset();
    }

    /// Mix the stutter voice over the rhythm buffer and drive the bloom
    fn render_stutter(&mut self, start_frame: u64, len: usize) {
        let Some(session) = &self.stutter else {
            return;
        };

        let rhythm = &mut self.stream_buffers[StreamId::Rhythm as usize];
        for i in 0..len {
            let f = start_frame + i as u64;
            if f >= session.start_frame() && !session.is_finished(f) {
                let slot = &mut rhythm[i];
                *slot *= session.duck_gain();
                *slot += session.sample_at(f);
            }
        }

        // Bloom: the reverb wet follows the pulse index through an eased ramp
        if let Some(pulse) = session.pulse_index(start_frame) {
            let wet = session.wet_at_pulse(pulse);
            self.streams[StreamId::Rhythm as usize]
                .reverb_mut()
                .set_mix(wet);
        }

        let end_frame = start_frame + len as u64;
        let began = !self.stutter_began && end_frame > session.start_frame();
        let start = session.start_frame();
        let finished = session.is_finished(end_frame);
        let finish_frame = session
            .release()
            .map(|r| r.at_frame)
            .unwrap_or(end_frame);

        if began {
            self.stutter_began = true;
            self.push_event(RenderEvent::StutterBegan { at_frame: start });
        }

        if finished {
            // Restore the rhythm voice and ramp the reverb back down
            self.stutter = None;
            self.stutter_began = false;
            let baseline = self.reverb_baseline[StreamId::Rhythm as usize];
            self.streams[StreamId::Rhythm as usize]
                .reverb_mut()
                .set_mix(baseline);
            self.push_event(RenderEvent::StutterEnded {
                at_frame: finish_frame,
            });
        }
    }

    /// Render one buffer of audio
    ///
    /// Called from the audio callback; never blocks, never allocates.
    pub fn process(&mut self, output: &mut StereoBuffer) {
        let len = output.len();
        let start_frame = self.frame;

        // Commands are applied at buffer boundaries; their payloads carry
        // exact frames for anything that must land mid-buffer
        while let Ok(cmd) = self.commands.pop() {
            self.apply_command(cmd);
        }

        for buf in &mut self.stream_buffers {
            buf.set_len_from_capacity(len);
        }

        // Voices (seams included), then the stutter overlay on rhythm
        for idx in 0..NUM_STREAMS {
            let event = self.streams[idx].render_voices(&mut self.stream_buffers[idx], start_frame);
            if let Some(event) = event {
                self.push_event(event);
            }
        }
        self.render_stutter(start_frame, len);

        // LFO owns the melodic cutoff
        let cutoff = self
            .lfo
            .evaluate(self.transport.as_ref(), start_frame, len as u64);
        self.streams[StreamId::Melodic as usize]
            .filter_mut()
            .set_cutoff(cutoff);

        // Per-stream inserts: filter, then reverb
        for idx in 0..NUM_STREAMS {
            let (buf, stream) = (&mut self.stream_buffers[idx], &mut self.streams[idx]);
            stream.filter_mut().process(buf);
            stream.reverb_mut().process(buf);
        }

        // Sum to master and keep it inside full scale
        output.fill_silence();
        for buf in &self.stream_buffers {
            output.add_buffer(buf);
        }
        self.clipper.process(output);

        self.frame = start_frame + len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Transport;
    use crate::config::EngineConfig;
    use crate::engine::command::{command_channel, event_channel, DualSwitchOp};
    use crate::engine::gc::gc_handle;
    use crate::engine::seam::SeamStyle;
    use crate::loops::{LoopBuffer, LoopMetadata};
    use crate::types::StereoSample;
    use basedrop::Shared;

    struct Harness {
        engine: LoopEngine,
        commands: rtrb::Producer<EngineCommand>,
        events: rtrb::Consumer<RenderEvent>,
        output: StereoBuffer,
    }

    fn harness() -> Harness {
        let (cmd_tx, cmd_rx) = command_channel();
        let (evt_tx, evt_rx) = event_channel();
        Harness {
            engine: LoopEngine::new(&EngineConfig::default(), 48_000, cmd_rx, evt_tx),
            commands: cmd_tx,
            events: evt_rx,
            output: StereoBuffer::silence(256),
        }
    }

    impl Harness {
        fn pump(&mut self, buffers: usize) -> Vec<RenderEvent> {
            let mut events = Vec::new();
            for _ in 0..buffers {
                self.engine.process(&mut self.output);
                while let Ok(e) = self.events.pop() {
                    events.push(e);
                }
            }
            events
        }
    }

    fn make_loop(value: f32, frames: usize, beats: f64) -> Shared<LoopBuffer> {
        let lp = LoopBuffer::new(
            StreamId::Rhythm,
            StereoBuffer::from_vec(vec![StereoSample::mono(value); frames]),
            48_000,
            &LoopMetadata::empty().with("beats", beats),
        )
        .unwrap();
        Shared::new(&gc_handle(), lp)
    }

    #[test]
    fn test_silent_until_started() {
        let mut h = harness();
        h.pump(4);
        assert_eq!(h.output.peak(), 0.0);
    }

    #[test]
    fn test_start_voice_at_exact_frame() {
        let mut h = harness();
        h.commands
            .push(EngineCommand::StartVoice {
                stream: StreamId::Rhythm,
                content: make_loop(0.5, 48_000, 4.0),
                at_frame: 300,
            })
            .unwrap();

        h.engine.process(&mut h.output); // frames 0..256: silent
        assert_eq!(h.output.peak(), 0.0);

        h.engine.process(&mut h.output); // frames 256..512: starts at 300
        // The master clipper delays the bus by one sample
        assert_eq!(h.output[44].left, 0.0);
        assert_eq!(h.output[45].left, 0.5);
    }

    #[test]
    fn test_switch_emits_audible_event() {
        let mut h = harness();
        h.commands
            .push(EngineCommand::StartVoice {
                stream: StreamId::Melodic,
                content: make_loop(0.4, 48_000, 4.0),
                at_frame: 0,
            })
            .unwrap();
        let incoming = make_loop(-0.4, 48_000, 4.0);
        let incoming_id = incoming.id();
        h.commands
            .push(EngineCommand::SwitchLoop {
                stream: StreamId::Melodic,
                content: incoming,
                style: SeamStyle::HardCut,
                at_frame: 512,
                seam_frames: 96,
            })
            .unwrap();

        let events = h.pump(4);
        let audible = events
            .iter()
            .find_map(|e| match e {
                RenderEvent::SwitchAudible {
                    stream,
                    loop_id,
                    at_frame,
                    flipped,
                } => Some((*stream, *loop_id, *at_frame, *flipped)),
                _ => None,
            })
            .expect("switch should report");

        assert_eq!(audible.0, StreamId::Melodic);
        assert_eq!(audible.1, incoming_id);
        assert_eq!(audible.2, 512);
        assert!(audible.3);
    }

    #[test]
    fn test_dual_switch_changes_both_streams_without_flip() {
        let mut h = harness();
        for (stream, val) in [(StreamId::Rhythm, 0.3), (StreamId::Melodic, 0.2)] {
            h.commands
                .push(EngineCommand::StartVoice {
                    stream,
                    content: make_loop(val, 48_000, 4.0),
                    at_frame: 0,
                })
                .unwrap();
        }
        h.commands
            .push(EngineCommand::DualSwitch(Box::new(DualSwitchOp {
                rhythm: make_loop(-0.3, 48_000, 4.0),
                melodic: make_loop(-0.2, 48_000, 4.0),
                at_frame: 512,
                ramp_frames: 48,
            })))
            .unwrap();

        let events = h.pump(4);
        let flips: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                RenderEvent::SwitchAudible { flipped, at_frame, .. } => {
                    assert_eq!(*at_frame, 512);
                    Some(*flipped)
                }
                _ => None,
            })
            .collect();
        assert_eq!(flips, vec![false, false]);
    }

    #[test]
    fn test_stutter_lifecycle_through_commands() {
        let mut h = harness();
        let lp = make_loop(0.6, 48_000 * 2, 8.0);
        h.commands
            .push(EngineCommand::StartVoice {
                stream: StreamId::Rhythm,
                content: lp.clone(),
                at_frame: 0,
            })
            .unwrap();
        h.commands
            .push(EngineCommand::SetTransport(Transport::new(0, 120.0, 48_000)))
            .unwrap();

        let transport = Transport::new(0, 120.0, 48_000);
        let session = StutterSession::plan(
            &gc_handle(),
            &lp,
            &transport,
            &EngineConfig::default().stutter,
            0,
            0,
            0.1,
        )
        .unwrap();
        let spacing = session.pulse_spacing();
        let start = session.start_frame();

        h.commands
            .push(EngineCommand::StartStutter(Box::new(session)))
            .unwrap();
        h.commands
            .push(EngineCommand::ReleaseStutter {
                at_frame: start + 2 * spacing,
                fade_frames: 480,
            })
            .unwrap();

        // Render past the release boundary
        let buffers = ((start + 2 * spacing) / 256 + 4) as usize;
        let events = h.pump(buffers);

        let began = events.iter().any(|e| matches!(e, RenderEvent::StutterBegan { at_frame } if *at_frame == start));
        let ended = events.iter().any(|e| matches!(e, RenderEvent::StutterEnded { at_frame } if *at_frame == start + 2 * spacing));
        assert!(began, "missing StutterBegan: {:?}", events);
        assert!(ended, "missing StutterEnded: {:?}", events);
    }

    #[test]
    fn test_stop_all_clears_pending_and_stutter() {
        let mut h = harness();
        let lp = make_loop(0.6, 48_000, 8.0);
        h.commands
            .push(EngineCommand::StartVoice {
                stream: StreamId::Rhythm,
                content: lp.clone(),
                at_frame: 0,
            })
            .unwrap();
        h.commands
            .push(EngineCommand::SwitchLoop {
                stream: StreamId::Rhythm,
                content: make_loop(0.1, 48_000, 8.0),
                style: SeamStyle::Crossfade,
                at_frame: 100_000,
                seam_frames: 1200,
            })
            .unwrap();

        let transport = Transport::new(0, 120.0, 48_000);
        let session = StutterSession::plan(
            &gc_handle(),
            &lp,
            &transport,
            &EngineConfig::default().stutter,
            0,
            0,
            0.1,
        )
        .unwrap();
        h.commands
            .push(EngineCommand::StartStutter(Box::new(session)))
            .unwrap();

        h.pump(2);
        h.commands.push(EngineCommand::StopAll).unwrap();
        h.commands.push(EngineCommand::ClearTransport).unwrap();

        let events = h.pump(40);
        assert!(events.is_empty(), "no events after stop, got {:?}", events);
        assert_eq!(h.output.peak(), 0.0);
    }
}

//! Control-plane switch scheduler
//!
//! Runs on a fixed-rate tick, never on the render path. Each tick it drains
//! the render event ring (forwarding typed events to subscribers), emits
//! per-stream progress, and promotes pending switches whose target beat has
//! entered the lead window into declarative render commands.
//!
//! The one cross-stream operation is the simultaneous dual switch: when both
//! streams' pending targets coincide within tolerance, both are executed
//! in-place against a single shared boundary — the shared queued beat if it
//! is still in the future, otherwise the next multiple of the two loop
//! lengths' LCM — so neither stream is cut mid-loop.

use std::sync::{Arc, Mutex};

use basedrop::Shared;

use crate::clock::{frames_to_seconds, Clock, Transport};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventHub, SharedStreamAtomics};
use crate::loops::{LoopBuffer, LoopId, LoopMetadata};
use crate::types::{StreamId, NUM_STREAMS};

use super::command::{DualSwitchOp, EngineCommand, RenderEvent};
use super::seam::{classify, SeamStyle};

/// The loop a stream is currently sounding, as the control plane sees it
pub struct CurrentLoop {
    pub content: Shared<LoopBuffer>,
    pub id: LoopId,
    pub beats: f64,
    /// Beat at which this loop's phase 0 fell
    pub anchor_beat: f64,
    pub sequence_index: Option<u64>,
}

/// At most one queued switch per stream
pub struct PendingSwitch {
    pub content: Shared<LoopBuffer>,
    pub id: LoopId,
    pub beats: f64,
    pub style: SeamStyle,
    pub target_beat: f64,
    pub sequence_index: Option<u64>,
}

impl PendingSwitch {
    pub fn new(content: Shared<LoopBuffer>, metadata: &LoopMetadata, target_beat: f64) -> Self {
        Self {
            id: content.id(),
            beats: content.beats(),
            style: classify(metadata),
            sequence_index: metadata.sequence_index(),
            content,
            target_beat,
        }
    }
}

/// Per-stream control state
#[derive(Default)]
pub struct StreamCtl {
    pub current: Option<CurrentLoop>,
    pub pending: Option<PendingSwitch>,
    /// Next sequence index a continuation producer should deliver
    pub expected_seq: Option<u64>,
}

/// Everything the control plane knows; single-writer via one mutex shared
/// between the public API and the scheduler tick
pub struct ControlState {
    pub transport: Option<Transport>,
    pub bpm: f64,
    pub first_start_done: bool,
    pub stutter_engaged: bool,
    /// Reverb wet baselines as last set by the user (stutter bloom base)
    pub reverb_mix: [f32; NUM_STREAMS],
    pub streams: [StreamCtl; NUM_STREAMS],
}

impl ControlState {
    pub fn new(bpm: f64) -> Self {
        Self {
            transport: None,
            bpm,
            first_start_done: false,
            stutter_engaged: false,
            reverb_mix: [0.0; NUM_STREAMS],
            streams: [StreamCtl::default(), StreamCtl::default()],
        }
    }

    pub fn stream(&self, id: StreamId) -> &StreamCtl {
        &self.streams[id as usize]
    }

    pub fn stream_mut(&mut self, id: StreamId) -> &mut StreamCtl {
        &mut self.streams[id as usize]
    }
}

/// Next boundary beat >= now for a loop of `loop_beats` anchored at `anchor_beat`
pub fn next_boundary_beat(
    transport: &Transport,
    anchor_beat: f64,
    now_frame: u64,
    loop_beats: f64,
) -> f64 {
    debug_assert!(loop_beats > 0.0);
    let now_beat = transport.beat_at_frame(now_frame);
    let rel = (now_beat - anchor_beat).max(0.0);
    let cycles = (rel / loop_beats - 1e-9).ceil().max(0.0);
    anchor_beat + cycles * loop_beats
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// LCM of two loop lengths in beats (rounded to whole beats)
fn lcm_beats(a: f64, b: f64) -> f64 {
    let ai = (a.round() as u64).max(1);
    let bi = (b.round() as u64).max(1);
    (ai / gcd(ai, bi) * bi) as f64
}

/// The fixed-rate control-plane scheduler
pub struct SwitchScheduler {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    hub: Arc<EventHub>,
    atomics: SharedStreamAtomics,
    commands: Arc<Mutex<rtrb::Producer<EngineCommand>>>,
    events: rtrb::Consumer<RenderEvent>,
}

impl SwitchScheduler {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        hub: Arc<EventHub>,
        atomics: SharedStreamAtomics,
        commands: Arc<Mutex<rtrb::Producer<EngineCommand>>>,
        events: rtrb::Consumer<RenderEvent>,
    ) -> Self {
        Self {
            config,
            clock,
            hub,
            atomics,
            commands,
            events,
        }
    }

    fn push_command(&self, cmd: EngineCommand) -> bool {
        let mut producer = self.commands.lock().expect("command producer poisoned");
        if producer.push(cmd).is_err() {
            log::warn!("scheduler: command ring full, operation dropped");
            return false;
        }
        true
    }

    /// Forward render-side facts to subscribers
    fn drain_render_events(&mut self, state: &mut ControlState) {
        let sample_rate = self.clock.sample_rate();
        while let Ok(event) = self.events.pop() {
            match event {
                RenderEvent::SwitchAudible {
                    stream,
                    loop_id,
                    at_frame,
                    ..
                } => {
                    let audible_seconds = frames_to_seconds(at_frame, sample_rate);
                    self.hub.publish(EngineEvent::LoopSwitched {
                        stream,
                        loop_id,
                        audible_seconds,
                    });
                    self.atomics[stream as usize].store_loop_id(Some(loop_id));

                    // Sequence-tagged chunks additionally pace the producer
                    let ctl = state.stream(stream);
                    if let Some(current) = &ctl.current {
                        if current.id == loop_id {
                            if let Some(seq) = current.sequence_index {
                                self.hub.publish(EngineEvent::ChunkAudible {
                                    stream,
                                    sequence_index: seq,
                                    audible_seconds,
                                });
                            }
                        }
                    }
                }
                RenderEvent::StutterBegan { at_frame } => {
                    self.hub.publish(EngineEvent::StutterStarted {
                        at_seconds: frames_to_seconds(at_frame, sample_rate),
                    });
                }
                RenderEvent::StutterEnded { at_frame } => {
                    state.stutter_engaged = false;
                    self.hub.publish(EngineEvent::StutterStopped {
                        at_seconds: frames_to_seconds(at_frame, sample_rate),
                    });
                }
            }
        }
    }

    /// Promote both pendings against one shared boundary (no flip)
    fn promote_dual(&mut self, state: &mut ControlState, transport: Transport, now_frame: u64) {
        let now_beat = transport.beat_at_frame(now_frame);

        let (rhythm_target, melodic_target) = {
            let r = state.stream(StreamId::Rhythm).pending.as_ref().unwrap();
            let m = state.stream(StreamId::Melodic).pending.as_ref().unwrap();
            (r.target_beat, m.target_beat)
        };

        // Prefer the shared queued beat while it is still in the future
        let shared_beat = if (rhythm_target - melodic_target).abs() < 1e-9
            && transport.frame_for_beat(rhythm_target) > now_frame
        {
            rhythm_target
        } else {
            let (r_beats, m_beats) = {
                let r = state.stream(StreamId::Rhythm).current.as_ref();
                let m = state.stream(StreamId::Melodic).current.as_ref();
                (
                    r.map(|c| c.beats).unwrap_or(1.0),
                    m.map(|c| c.beats).unwrap_or(1.0),
                )
            };
            let lcm = lcm_beats(r_beats, m_beats);
            let cycles = (now_beat / lcm + 1e-9).floor() + 1.0;
            cycles * lcm
        };

        let at_frame = transport.frame_for_beat(shared_beat);
        let ramp_frames = (self.config.timing.hard_cut_ramp_seconds
            * transport.sample_rate as f64)
            .round() as u64;

        let rhythm = state.stream_mut(StreamId::Rhythm).pending.take().unwrap();
        let melodic = state.stream_mut(StreamId::Melodic).pending.take().unwrap();

        log::info!(
            "scheduler: dual switch at beat {:.2} (targets were {:.2} / {:.2})",
            shared_beat,
            rhythm_target,
            melodic_target
        );

        let pushed = self.push_command(EngineCommand::DualSwitch(Box::new(DualSwitchOp {
            rhythm: rhythm.content.clone(),
            melodic: melodic.content.clone(),
            at_frame,
            ramp_frames,
        })));
        if !pushed {
            return;
        }

        for (stream, pending) in [(StreamId::Rhythm, rhythm), (StreamId::Melodic, melodic)] {
            state.stream_mut(stream).current = Some(CurrentLoop {
                id: pending.id,
                beats: pending.beats,
                anchor_beat: shared_beat,
                sequence_index: pending.sequence_index,
                content: pending.content,
            });
        }
    }

    /// Promote one stream's pending switch
    fn promote_single(&mut self, state: &mut ControlState, transport: Transport, stream: StreamId, now_frame: u64) {
        let ctl = state.stream_mut(stream);
        let Some(pending) = ctl.pending.take() else {
            return;
        };

        let at_frame = transport.frame_for_beat(pending.target_beat);
        let target_beat = pending.target_beat;
        let seam_seconds = match pending.style {
            SeamStyle::Crossfade => self.config.timing.crossfade_seconds,
            SeamStyle::HardCut => self.config.timing.hard_cut_ramp_seconds,
        };
        let seam_frames = (seam_seconds * transport.sample_rate as f64).round() as u64;

        log::info!(
            "scheduler: {} switch to {:?} at beat {:.2} ({:?})",
            stream.name(),
            pending.id,
            pending.target_beat,
            pending.style
        );

        let pushed = self.push_command(EngineCommand::SwitchLoop {
            stream,
            content: pending.content.clone(),
            style: pending.style,
            at_frame,
            seam_frames,
        });
        if !pushed {
            // Abandoned for this occurrence only; the pending stays queued
            state.stream_mut(stream).pending = Some(pending);
            return;
        }

        state.stream_mut(stream).current = Some(CurrentLoop {
            id: pending.id,
            beats: pending.beats,
            anchor_beat: pending.target_beat,
            sequence_index: pending.sequence_index,
            content: pending.content,
        });

        if now_frame >= at_frame {
            log::warn!(
                "scheduler: {} promotion ran late (target beat {:.2})",
                stream.name(),
                target_beat
            );
        }
    }

    /// One fixed-rate tick
    pub fn tick(&mut self, state: &mut ControlState) {
        self.drain_render_events(state);

        let Some(transport) = state.transport else {
            return;
        };

        let now_frame = self
            .clock
            .now_or_fallback(self.config.timing.fallback_lead_seconds);
        let now_beat = transport.beat_at_frame(now_frame);
        let lead_beats = self.config.timing.switch_lead_seconds * transport.bpm / 60.0;

        // Late pendings first: roll a missed target to the current loop's
        // next boundary so execution stays boundary-aligned
        for stream in StreamId::ALL {
            let ctl = state.stream_mut(stream);
            if let (Some(pending), Some(current)) = (ctl.pending.as_mut(), ctl.current.as_ref()) {
                if pending.target_beat + 1e-6 < now_beat {
                    let rolled = next_boundary_beat(
                        &transport,
                        current.anchor_beat,
                        now_frame,
                        current.beats,
                    );
                    log::warn!(
                        "scheduler: {} missed beat {:.2}, rolling to {:.2}",
                        stream.name(),
                        pending.target_beat,
                        rolled
                    );
                    pending.target_beat = rolled;
                }
            }
        }

        // Dual simultaneous case, checked before per-stream promotion
        let dual = {
            let r = state.stream(StreamId::Rhythm).pending.as_ref();
            let m = state.stream(StreamId::Melodic).pending.as_ref();
            match (r, m) {
                (Some(r), Some(m)) => {
                    let within_tolerance = (r.target_beat - m.target_beat).abs()
                        <= self.config.dual_tolerance_beats(transport.bpm);
                    let due = r.target_beat.min(m.target_beat) <= now_beat + lead_beats;
                    within_tolerance && due
                }
                _ => false,
            }
        };

        if dual {
            self.promote_dual(state, transport, now_frame);
        } else {
            for stream in StreamId::ALL {
                let due = state
                    .stream(stream)
                    .pending
                    .as_ref()
                    .map(|p| p.target_beat <= now_beat + lead_beats)
                    .unwrap_or(false);
                if due {
                    self.promote_single(state, transport, stream, now_frame);
                }
            }
        }

        // Progress, at the tick rate
        for stream in StreamId::ALL {
            let ctl = state.stream(stream);
            if let Some(current) = &ctl.current {
                let rel = (now_beat - current.anchor_beat).max(0.0);
                let beat_in_loop = rel % current.beats;
                let seconds_into_loop = beat_in_loop * 60.0 / transport.bpm;

                self.atomics[stream as usize].store_position(seconds_into_loop, beat_in_loop);
                self.hub.publish(EngineEvent::Progress {
                    stream,
                    seconds_into_loop,
                    beat_in_loop,
                });
            }
        }
    }
}

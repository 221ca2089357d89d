//! End-to-end scheduling scenarios against the virtual clock
//!
//! These drive the real controller (scheduler thread included) and pump the
//! render engine by hand, asserting the event sequences external consumers
//! would observe.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::Receiver;

use cadence_core::clock::{Clock, VirtualClock};
use cadence_core::config::EngineConfig;
use cadence_core::engine::{EngineController, LoopEngine};
use cadence_core::error::EngineError;
use cadence_core::events::EngineEvent;
use cadence_core::loops::LoopMetadata;
use cadence_core::types::{StereoBuffer, StereoSample, StreamId};

const SR: u32 = 48_000;

struct Rig {
    controller: EngineController,
    engine: LoopEngine,
    clock: Arc<VirtualClock>,
    events: Receiver<EngineEvent>,
    output: StereoBuffer,
}

fn rig() -> Rig {
    let clock = Arc::new(VirtualClock::new(SR));
    let (controller, engine) =
        EngineController::new(EngineConfig::default(), clock.clone() as Arc<dyn Clock>);
    let events = controller.subscribe();
    Rig {
        controller,
        engine,
        clock,
        events,
        output: StereoBuffer::silence(256),
    }
}

impl Rig {
    /// Render until the engine has produced at least `seconds` of audio
    fn pump_to(&mut self, seconds: f64) {
        let target = (seconds * SR as f64) as u64;
        while self.engine.frames_rendered() < target {
            self.engine.process(&mut self.output);
        }
    }

    /// Move the virtual clock and give the scheduler thread time to tick
    fn advance_clock_to(&self, seconds: f64) {
        self.clock.set_frames((seconds * SR as f64) as u64);
        thread::sleep(Duration::from_millis(200));
    }

    fn drain(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }
}

fn tone_loop(value: f32, beats: f64, bpm: f64) -> StereoBuffer {
    let frames = (beats * 60.0 / bpm * SR as f64) as usize;
    StereoBuffer::from_vec(vec![StereoSample::mono(value); frames])
}

#[test]
fn hard_cut_switch_lands_on_beat_sixteen() {
    let mut rig = rig();
    let meta = LoopMetadata::empty().with("beats", 16);

    rig.controller.set_bpm(120.0).unwrap();
    rig.controller
        .submit_loop(StreamId::Rhythm, tone_loop(0.4, 16.0, 120.0), SR, meta.clone())
        .unwrap();
    rig.controller.start().unwrap();

    // BPM is locked while the transport runs
    assert!(matches!(
        rig.controller.set_bpm(90.0),
        Err(EngineError::BpmWhilePlaying { .. })
    ));

    let start_seconds = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::Started { start_seconds, .. } => Some(*start_seconds),
            _ => None,
        })
        .expect("Started event");

    // 3.9 seconds in (before the 8s cycle ends): submit unrelated loop B
    rig.advance_clock_to(start_seconds + 3.9);
    let b_id = rig
        .controller
        .submit_loop(StreamId::Rhythm, tone_loop(-0.4, 16.0, 120.0), SR, meta)
        .unwrap();

    // Queued for beat 16, the 8.0s mark of the running loop
    let queued = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::LoopQueued {
                loop_id,
                target_beat,
                ..
            } => Some((*loop_id, *target_beat)),
            _ => None,
        })
        .expect("LoopQueued event");
    assert_eq!(queued.0, b_id);
    assert_eq!(queued.1, 16.0);

    // Enter the lead window; the scheduler promotes the pending switch
    rig.advance_clock_to(start_seconds + 7.96);

    // Render through the boundary and let the scheduler forward the report
    rig.pump_to(start_seconds + 8.5);
    thread::sleep(Duration::from_millis(200));

    let switched = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::LoopSwitched {
                stream,
                loop_id,
                audible_seconds,
            } => Some((*stream, *loop_id, *audible_seconds)),
            _ => None,
        })
        .expect("LoopSwitched event");

    assert_eq!(switched.0, StreamId::Rhythm);
    assert_eq!(switched.1, b_id);
    // Audible exactly at the beat-16 boundary
    assert!(
        (switched.2 - (start_seconds + 8.0)).abs() < 1e-6,
        "audible at {} but boundary is {}",
        switched.2,
        start_seconds + 8.0
    );

    // The designation flipped: the atomics now report loop B
    let atomics = rig.controller.stream_atomics();
    assert_eq!(atomics[StreamId::Rhythm as usize].loop_id(), Some(b_id));
}

#[test]
fn continuation_chunks_crossfade_and_pace_the_producer() {
    let mut rig = rig();
    let meta = LoopMetadata::empty().with("beats", 32);

    rig.controller.set_bpm(120.0).unwrap();
    rig.controller
        .submit_loop(StreamId::Melodic, tone_loop(0.3, 32.0, 120.0), SR, meta.clone())
        .unwrap();
    rig.controller.start().unwrap();

    let start_seconds = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::Started { start_seconds, .. } => Some(*start_seconds),
            _ => None,
        })
        .expect("Started event");

    // Two continuation chunks, delivered one loop apart (32 beats = 16s)
    for (chunk, boundary) in [(0u64, 16.0), (1u64, 32.0)] {
        let chunk_meta = meta.clone().with("sequence_index", chunk);
        rig.advance_clock_to(start_seconds + boundary - 2.0);
        rig.controller
            .submit_loop(StreamId::Melodic, tone_loop(0.3, 32.0, 120.0), SR, chunk_meta)
            .unwrap();

        rig.advance_clock_to(start_seconds + boundary - 0.03);
        rig.pump_to(start_seconds + boundary + 0.5);
        thread::sleep(Duration::from_millis(200));

        let events = rig.drain();
        let audible = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::ChunkAudible {
                    sequence_index,
                    audible_seconds,
                    ..
                } => Some((*sequence_index, *audible_seconds)),
                _ => None,
            })
            .unwrap_or_else(|| panic!("ChunkAudible for chunk {}: {:?}", chunk, events));

        assert_eq!(audible.0, chunk);
        assert!(
            (audible.1 - (start_seconds + boundary)).abs() < 1e-6,
            "chunk {} audible at {}, expected {}",
            chunk,
            audible.1,
            start_seconds + boundary
        );
    }
}

#[test]
fn stutter_pulses_land_on_the_sub_beat_grid() {
    let mut rig = rig();
    // BPM 100, grid 0.25 beats -> 0.15s pulse spacing
    rig.controller.set_bpm(100.0).unwrap();
    rig.controller
        .submit_loop(
            StreamId::Rhythm,
            tone_loop(0.5, 16.0, 100.0),
            SR,
            LoopMetadata::empty().with("beats", 16),
        )
        .unwrap();
    rig.controller.start().unwrap();

    let start_seconds = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::Started { start_seconds, .. } => Some(*start_seconds),
            _ => None,
        })
        .expect("Started event");

    // Engage mid-loop, between grid boundaries
    let engage_at = start_seconds + 1.02;
    rig.advance_clock_to(engage_at);
    rig.controller.stutter_engage().unwrap();

    rig.pump_to(engage_at + 1.0);
    thread::sleep(Duration::from_millis(200));

    let started_at = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::StutterStarted { at_seconds } => Some(*at_seconds),
            _ => None,
        })
        .expect("StutterStarted event");

    // First pulse strictly after engage, on a 0.25-beat (0.15s) grid line
    assert!(started_at > engage_at);
    let beats_in = (started_at - start_seconds) / 0.6; // seconds per beat at 100 bpm
    let grid_pos = beats_in / 0.25;
    assert!(
        (grid_pos - grid_pos.round()).abs() < 1e-6,
        "stutter started off-grid at beat {}",
        beats_in
    );
}

#[test]
fn stop_clears_pending_switch_and_stutter_session() {
    let mut rig = rig();
    let meta = LoopMetadata::empty().with("beats", 16);

    rig.controller.set_bpm(120.0).unwrap();
    rig.controller
        .submit_loop(StreamId::Rhythm, tone_loop(0.5, 16.0, 120.0), SR, meta.clone())
        .unwrap();
    rig.controller.start().unwrap();

    let start_seconds = rig
        .drain()
        .iter()
        .find_map(|e| match e {
            EngineEvent::Started { start_seconds, .. } => Some(*start_seconds),
            _ => None,
        })
        .expect("Started event");

    rig.advance_clock_to(start_seconds + 1.0);
    rig.pump_to(start_seconds + 1.0);

    // Leave both a queued switch and an engaged stutter outstanding
    rig.controller
        .submit_loop(StreamId::Rhythm, tone_loop(-0.5, 16.0, 120.0), SR, meta)
        .unwrap();
    rig.controller.stutter_engage().unwrap();

    rig.controller.stop().unwrap();
    rig.drain();

    // Run well past where the switch and pulses would have fired
    rig.advance_clock_to(start_seconds + 10.0);
    rig.pump_to(start_seconds + 10.0);
    thread::sleep(Duration::from_millis(250));

    let events = rig.drain();
    let leftovers: Vec<_> = events
        .iter()
        .filter(|e| {
            !matches!(
                e,
                EngineEvent::Stopped | EngineEvent::Progress { .. }
            )
        })
        .collect();
    assert!(
        leftovers.is_empty(),
        "scheduled work fired after stop: {:?}",
        leftovers
    );

    // And the render path is silent
    let mut buffer = StereoBuffer::silence(512);
    rig.engine.process(&mut buffer);
    assert_eq!(buffer.peak(), 0.0);
}

//! Public engine API and control-plane ownership
//!
//! `EngineController` is what applications hold: submit loops, start/stop,
//! tweak effects, engage the stutter. It owns the control-plane state behind
//! one mutex (single-writer transport discipline: start/stop/BPM changes and
//! the scheduler tick serialize on it) and talks to the render path only
//! through the lock-free command ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Handle, Shared};
use crossbeam::channel::Receiver;

use crate::clock::{seconds_to_frames, Clock, Transport};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventHub, SharedStreamAtomics, StreamAtomics};
use crate::loops::{LoopBuffer, LoopId, LoopMetadata};
use crate::types::{StereoBuffer, StreamId};

use super::command::{command_channel, event_channel, EngineCommand};
use super::engine::LoopEngine;
use super::gc::gc_handle;
use super::scheduler::{next_boundary_beat, ControlState, CurrentLoop, PendingSwitch, SwitchScheduler};
use super::stutter::StutterSession;

/// Global BPM range
pub const MIN_BPM: f64 = 30.0;
pub const MAX_BPM: f64 = 240.0;
pub const DEFAULT_BPM: f64 = 120.0;

/// The application-facing engine handle
///
/// Dropping the controller shuts the scheduler thread down; the render
/// engine (owned by the audio backend) simply stops receiving commands.
pub struct EngineController {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    hub: Arc<EventHub>,
    atomics: SharedStreamAtomics,
    state: Arc<Mutex<ControlState>>,
    commands: Arc<Mutex<rtrb::Producer<EngineCommand>>>,
    gc: Handle,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
    scheduler_thread: Option<JoinHandle<()>>,
}

impl EngineController {
    /// Build the controller plus the render engine for the audio backend
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> (Self, LoopEngine) {
        let sample_rate = clock.sample_rate();
        let (cmd_tx, cmd_rx) = command_channel();
        let (evt_tx, evt_rx) = event_channel();

        let engine = LoopEngine::new(&config, sample_rate, cmd_rx, evt_tx);

        let hub = Arc::new(EventHub::new());
        let atomics: SharedStreamAtomics = [
            Arc::new(StreamAtomics::new()),
            Arc::new(StreamAtomics::new()),
        ];
        let state = Arc::new(Mutex::new(ControlState::new(DEFAULT_BPM)));
        let commands = Arc::new(Mutex::new(cmd_tx));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut scheduler = SwitchScheduler::new(
            config.clone(),
            Arc::clone(&clock),
            Arc::clone(&hub),
            [Arc::clone(&atomics[0]), Arc::clone(&atomics[1])],
            Arc::clone(&commands),
            evt_rx,
        );

        let scheduler_thread = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let tick = Duration::from_secs_f64(config.timing.tick_seconds);
            thread::Builder::new()
                .name("cadence-scheduler".to_string())
                .spawn(move || {
                    log::info!("scheduler thread started ({:?} tick)", tick);
                    while !shutdown.load(Ordering::Relaxed) {
                        {
                            let mut state = state.lock().expect("control state poisoned");
                            scheduler.tick(&mut state);
                        }
                        thread::sleep(tick);
                    }
                })
                .expect("Failed to spawn scheduler thread")
        };

        let controller = Self {
            config,
            clock,
            hub,
            atomics,
            state,
            commands,
            gc: gc_handle(),
            sample_rate,
            shutdown,
            scheduler_thread: Some(scheduler_thread),
        };
        (controller, engine)
    }

    /// Subscribe to the typed event stream
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.hub.subscribe()
    }

    /// Lock-free per-stream position mirrors
    pub fn stream_atomics(&self) -> SharedStreamAtomics {
        [Arc::clone(&self.atomics[0]), Arc::clone(&self.atomics[1])]
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bpm(&self) -> f64 {
        self.state.lock().expect("control state poisoned").bpm
    }

    pub fn is_playing(&self) -> bool {
        self.state
            .lock()
            .expect("control state poisoned")
            .transport
            .is_some()
    }

    fn push(&self, cmd: EngineCommand) -> EngineResult<()> {
        let mut producer = self.commands.lock().expect("command producer poisoned");
        producer.push(cmd).map_err(|_| EngineError::CommandQueueFull)
    }

    /// Submit a decoded loop for a stream
    ///
    /// Stopped (or stream idle): the loop becomes the stream's content
    /// immediately. Playing: it is queued for the current loop's next aligned
    /// boundary and a `LoopQueued` event fires. Never blocks on audio.
    pub fn submit_loop(
        &self,
        stream: StreamId,
        samples: StereoBuffer,
        sample_rate: u32,
        metadata: LoopMetadata,
    ) -> EngineResult<LoopId> {
        let lp = LoopBuffer::new(stream, samples, sample_rate, &metadata)?;
        let id = lp.id();
        let beats = lp.beats();

        if sample_rate != self.sample_rate {
            log::warn!(
                "submit_loop: {} loop is {}Hz, engine runs {}Hz (no resampling)",
                stream.name(),
                sample_rate,
                self.sample_rate
            );
        }

        let content = Shared::new(&self.gc, lp);
        let mut state = self.state.lock().expect("control state poisoned");

        // Continuation bookkeeping: a mismatched index is a data-quality
        // warning for the producer, never a playback error
        if let Some(seq) = metadata.sequence_index() {
            let ctl = state.stream_mut(stream);
            if let Some(expected) = ctl.expected_seq {
                if seq != expected {
                    log::warn!(
                        "submit_loop: {} sequence index {} (expected {})",
                        stream.name(),
                        seq,
                        expected
                    );
                }
            }
            ctl.expected_seq = Some(seq + 1);
        }

        match (state.transport, state.stream(stream).current.is_some()) {
            // Playing with content: queue for the next aligned boundary
            (Some(transport), true) => {
                let now = self
                    .clock
                    .now_or_fallback(self.config.timing.fallback_lead_seconds);
                let current = state.stream(stream).current.as_ref().unwrap();
                let target_beat =
                    next_boundary_beat(&transport, current.anchor_beat, now, current.beats);

                let ctl = state.stream_mut(stream);
                if ctl.pending.is_some() {
                    log::debug!(
                        "submit_loop: {} replacing queued switch (latest wins)",
                        stream.name()
                    );
                }
                ctl.pending = Some(PendingSwitch::new(content, &metadata, target_beat));

                self.hub.publish(EngineEvent::LoopQueued {
                    stream,
                    loop_id: id,
                    target_beat,
                });
            }
            // Playing but this stream is idle: join on the next whole beat
            (Some(transport), false) => {
                let now = self
                    .clock
                    .now_or_fallback(self.config.timing.fallback_lead_seconds);
                let target_beat = transport.beat_at_frame(now).floor() + 1.0;
                let at_frame = transport.frame_for_beat(target_beat);

                self.push(EngineCommand::StartVoice {
                    stream,
                    content: content.clone(),
                    at_frame,
                })?;

                state.stream_mut(stream).current = Some(CurrentLoop {
                    id,
                    beats,
                    anchor_beat: target_beat,
                    sequence_index: metadata.sequence_index(),
                    content,
                });
                self.atomics[stream as usize].store_playing(true);
                self.atomics[stream as usize].store_loop_id(Some(id));
            }
            // Stopped: assign directly; start() will schedule it
            (None, _) => {
                state.stream_mut(stream).current = Some(CurrentLoop {
                    id,
                    beats,
                    anchor_beat: 0.0,
                    sequence_index: metadata.sequence_index(),
                    content,
                });
                state.stream_mut(stream).pending = None;
                self.atomics[stream as usize].store_loop_id(Some(id));
            }
        }

        Ok(id)
    }

    /// Start playback at an exact near-future device time
    ///
    /// The first start after construction uses a long lead and primes the
    /// standby voices to absorb device warm-up; later starts use a short one.
    pub fn start(&self) -> EngineResult<()> {
        let mut state = self.state.lock().expect("control state poisoned");
        if state.transport.is_some() {
            log::debug!("start: already playing");
            return Ok(());
        }
        if state.streams.iter().all(|s| s.current.is_none()) {
            return Err(EngineError::NoLoop(StreamId::Rhythm));
        }

        let lead = if state.first_start_done {
            self.config.timing.start_lead_seconds
        } else {
            self.config.timing.first_start_lead_seconds
        };
        let now = self
            .clock
            .now_or_fallback(self.config.timing.fallback_lead_seconds);
        let start_frame = now + seconds_to_frames(lead, self.sample_rate);
        let transport = Transport::new(start_frame, state.bpm, self.sample_rate);

        self.push(EngineCommand::SetTransport(transport))?;

        if !state.first_start_done {
            for stream in StreamId::ALL {
                self.push(EngineCommand::PrimeStandby { stream })?;
            }
        }

        for stream in StreamId::ALL {
            let ctl = state.stream_mut(stream);
            if let Some(current) = ctl.current.as_mut() {
                current.anchor_beat = 0.0;
                self.push(EngineCommand::StartVoice {
                    stream,
                    content: current.content.clone(),
                    at_frame: start_frame,
                })?;
                self.atomics[stream as usize].store_playing(true);
            }
        }

        state.transport = Some(transport);
        state.first_start_done = true;

        let start_seconds = start_frame as f64 / self.sample_rate as f64;
        log::info!(
            "start: transport at {:.3}s, {} bpm (lead {:.0}ms)",
            start_seconds,
            transport.bpm,
            lead * 1000.0
        );
        self.hub.publish(EngineEvent::Started {
            start_seconds,
            bpm: transport.bpm,
        });
        Ok(())
    }

    /// Stop playback immediately
    ///
    /// Clears the transport, every pending switch, all scheduled render
    /// operations, and any active stutter session. Loaded content stays
    /// assigned so `start()` can bring it back.
    pub fn stop(&self) -> EngineResult<()> {
        let mut state = self.state.lock().expect("control state poisoned");

        self.push(EngineCommand::StopAll)?;
        self.push(EngineCommand::ClearTransport)?;

        state.transport = None;
        state.stutter_engaged = false;
        for stream in StreamId::ALL {
            state.stream_mut(stream).pending = None;
            self.atomics[stream as usize].store_playing(false);
            self.atomics[stream as usize].store_position(0.0, 0.0);
        }

        log::info!("stop: transport cleared");
        self.hub.publish(EngineEvent::Stopped);
        Ok(())
    }

    /// Set the BPM; only valid while stopped
    pub fn set_bpm(&self, bpm: f64) -> EngineResult<()> {
        let mut state = self.state.lock().expect("control state poisoned");
        if let Some(transport) = state.transport {
            return Err(EngineError::BpmWhilePlaying {
                current: transport.bpm,
            });
        }
        state.bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        Ok(())
    }

    /// Restart a stream's loop at its next aligned boundary
    ///
    /// Not a true mid-loop seek: the loop re-enters at phase 0 on the
    /// boundary, exactly like a same-content switch.
    pub fn seek(&self, stream: StreamId, _approx_seconds: f64) -> EngineResult<()> {
        let mut state = self.state.lock().expect("control state poisoned");
        let Some(transport) = state.transport else {
            return Err(EngineError::NotPlaying);
        };
        let Some(current) = state.stream(stream).current.as_ref() else {
            return Err(EngineError::NoLoop(stream));
        };

        let now = self
            .clock
            .now_or_fallback(self.config.timing.fallback_lead_seconds);
        let target_beat = next_boundary_beat(&transport, current.anchor_beat, now, current.beats);

        // Same content is by definition a continuation of itself
        let mut pending = PendingSwitch::new(
            current.content.clone(),
            &LoopMetadata::empty().with("continuation", true),
            target_beat,
        );
        pending.sequence_index = current.sequence_index;
        let id = pending.id;
        state.stream_mut(stream).pending = Some(pending);

        self.hub.publish(EngineEvent::LoopQueued {
            stream,
            loop_id: id,
            target_beat,
        });
        Ok(())
    }

    /// Filter cutoff target for a stream (melodic: also the LFO max endpoint)
    pub fn set_filter_cutoff(&self, stream: StreamId, hz: f32) -> EngineResult<()> {
        self.push(EngineCommand::SetFilterCutoff { stream, hz })
    }

    /// Reverb wet baseline for a stream (0 = dry, 1 = fully wet)
    pub fn set_reverb_mix(&self, stream: StreamId, mix: f32) -> EngineResult<()> {
        let mix = mix.clamp(0.0, 1.0);
        {
            let mut state = self.state.lock().expect("control state poisoned");
            state.reverb_mix[stream as usize] = mix;
        }
        self.push(EngineCommand::SetReverbMix { stream, mix })
    }

    /// Enable (armed at the next whole beat) or disable (ramped) the LFO
    pub fn set_lfo_enabled(&self, enabled: bool) -> EngineResult<()> {
        let arm_beat = if enabled {
            let state = self.state.lock().expect("control state poisoned");
            match state.transport {
                Some(transport) => {
                    let now = self
                        .clock
                        .now_or_fallback(self.config.timing.fallback_lead_seconds);
                    transport.beat_at_frame(now).floor() + 1.0
                }
                // Armed before start: phase 0 lands on the first downbeat
                None => 0.0,
            }
        } else {
            0.0
        };
        self.push(EngineCommand::SetLfoEnabled { enabled, arm_beat })
    }

    /// Engage the stutter at the next sub-beat grid boundary
    ///
    /// If no working slice can be produced the engage is abandoned and the
    /// rhythm stream keeps playing untouched.
    pub fn stutter_engage(&self) -> EngineResult<()> {
        let mut state = self.state.lock().expect("control state poisoned");
        let Some(transport) = state.transport else {
            return Err(EngineError::NotPlaying);
        };
        if state.stutter_engaged {
            log::debug!("stutter_engage: already engaged");
            return Ok(());
        }
        let base_wet = state.reverb_mix[StreamId::Rhythm as usize];
        let Some(current) = state.stream(StreamId::Rhythm).current.as_ref() else {
            return Err(EngineError::NoLoop(StreamId::Rhythm));
        };

        let now = self
            .clock
            .now_or_fallback(self.config.timing.fallback_lead_seconds);
        let anchor_frame = transport.frame_for_beat(current.anchor_beat);

        let Some(session) = StutterSession::plan(
            &self.gc,
            &current.content,
            &transport,
            &self.config.stutter,
            now,
            anchor_frame,
            base_wet,
        ) else {
            log::warn!("stutter_engage: no working slice, abandoned");
            return Ok(());
        };

        self.push(EngineCommand::StartStutter(Box::new(session)))?;
        state.stutter_engaged = true;
        Ok(())
    }

    /// Release the stutter on the next grid boundary (never immediately)
    pub fn stutter_release(&self) -> EngineResult<()> {
        let state = self.state.lock().expect("control state poisoned");
        let Some(transport) = state.transport else {
            return Err(EngineError::NotPlaying);
        };
        if !state.stutter_engaged {
            return Ok(());
        }

        let now = self
            .clock
            .now_or_fallback(self.config.timing.fallback_lead_seconds);
        let grid = self.config.stutter.grid_beats;
        let now_beat = transport.beat_at_frame(now);
        let mut boundary_beat = (now_beat / grid).floor() * grid;
        while transport.frame_for_beat(boundary_beat) <= now {
            boundary_beat += grid;
        }
        let at_frame = transport.frame_for_beat(boundary_beat);
        let fade_frames =
            seconds_to_frames(self.config.stutter.release_fade_seconds, self.sample_rate);

        self.push(EngineCommand::ReleaseStutter {
            at_frame,
            fade_frames,
        })
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.scheduler_thread.take() {
            let _ = handle.join();
        }
    }
}

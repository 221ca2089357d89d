//! Typed engine events and lock-free position mirrors
//!
//! External consumers (UI, remote-jam pacing) observe the engine two ways:
//! a typed event channel per subscriber, and per-stream atomics that can be
//! polled without any locking. There is no global listener state; tests can
//! subscribe and assert exact event sequences.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::loops::LoopId;
use crate::types::StreamId;

/// Events emitted by the engine for external consumers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// Transport started; beat 0 falls at `start_seconds` on the device timeline
    Started { start_seconds: f64, bpm: f64 },
    /// Transport stopped; all pending work was cleared
    Stopped,
    /// Per-stream progress, emitted at the scheduler tick rate
    Progress {
        stream: StreamId,
        /// Seconds into the current loop cycle
        seconds_into_loop: f64,
        /// Fractional beat within the current loop cycle
        beat_in_loop: f64,
    },
    /// A submitted loop was queued for a future boundary
    LoopQueued {
        stream: StreamId,
        loop_id: LoopId,
        target_beat: f64,
    },
    /// A queued loop became audible at exactly this device time
    ///
    /// This is the timestamp pacing consumers must use: it reflects when the
    /// switch actually sounded, not when it was scheduled.
    LoopSwitched {
        stream: StreamId,
        loop_id: LoopId,
        audible_seconds: f64,
    },
    /// A sequence-tagged chunk became audible (remote producers advance on this)
    ChunkAudible {
        stream: StreamId,
        sequence_index: u64,
        audible_seconds: f64,
    },
    /// Stutter pulse train began at this device time
    StutterStarted { at_seconds: f64 },
    /// Stutter ended on its grid boundary at this device time
    StutterStopped { at_seconds: f64 },
}

/// Fan-out hub for engine events
///
/// Each subscriber gets its own unbounded channel; a subscriber that goes
/// away is pruned on the next publish.
#[derive(Default)]
pub struct EventHub {
    senders: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.senders.lock().expect("event hub poisoned").push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: EngineEvent) {
        let mut senders = self.senders.lock().expect("event hub poisoned");
        senders.retain(|tx| tx.send(event).is_ok());
    }
}

/// Lock-free playback state for one stream
///
/// The control plane writes these on every tick; any thread can read them
/// with relaxed loads. Fractional values are stored as f64 bit patterns.
pub struct StreamAtomics {
    /// Whether the stream has audible content
    playing: AtomicBool,
    /// Identity of the loop currently sounding
    loop_id: AtomicU64,
    /// Seconds into the current loop cycle (f64 bits)
    seconds_into_loop: AtomicU64,
    /// Fractional beat within the current loop cycle (f64 bits)
    beat_in_loop: AtomicU64,
}

impl StreamAtomics {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            loop_id: AtomicU64::new(0),
            seconds_into_loop: AtomicU64::new(0f64.to_bits()),
            beat_in_loop: AtomicU64::new(0f64.to_bits()),
        }
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn loop_id(&self) -> Option<LoopId> {
        match self.loop_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(LoopId(id)),
        }
    }

    #[inline]
    pub fn seconds_into_loop(&self) -> f64 {
        f64::from_bits(self.seconds_into_loop.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn beat_in_loop(&self) -> f64 {
        f64::from_bits(self.beat_in_loop.load(Ordering::Relaxed))
    }

    /// Control-plane write of a full position snapshot
    pub fn store_position(&self, seconds_into_loop: f64, beat_in_loop: f64) {
        self.seconds_into_loop
            .store(seconds_into_loop.to_bits(), Ordering::Relaxed);
        self.beat_in_loop
            .store(beat_in_loop.to_bits(), Ordering::Relaxed);
    }

    pub fn store_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed);
    }

    pub fn store_loop_id(&self, id: Option<LoopId>) {
        self.loop_id
            .store(id.map(|l| l.0).unwrap_or(0), Ordering::Relaxed);
    }
}

impl Default for StreamAtomics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared atomics for both streams
pub type SharedStreamAtomics = [Arc<StreamAtomics>; crate::types::NUM_STREAMS];

//! Loop buffers and their metadata
//!
//! A [`LoopBuffer`] is an immutable piece of decoded audio plus a length in
//! beats. Loops are replaced, never mutated: the render path holds them
//! behind `basedrop::Shared` so swapping one out never frees memory on the
//! audio thread.
//!
//! [`LoopMetadata`] is a loosely-typed key/value record. The engine reads a
//! handful of recognized keys and passes everything else through untouched,
//! so producers can attach whatever bookkeeping they like.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::types::{StereoBuffer, StreamId};

/// Beat length assumed when metadata carries neither a beat count nor a BPM hint
pub const DEFAULT_LOOP_BEATS: f64 = 8.0;

/// Beats per bar assumed when metadata specifies bars
const BEATS_PER_BAR: f64 = 4.0;

/// Unique identity of a submitted loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(pub u64);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

impl LoopId {
    /// Allocate the next process-unique loop id
    pub fn next() -> Self {
        Self(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Loosely-typed metadata accompanying a submitted loop
///
/// Recognized keys:
/// - `beats` (number): explicit length in beats
/// - `bars` (number): explicit length in bars (4 beats each)
/// - `bpm_hint` (number): tempo of the material, used with the buffer
///   duration when no explicit length is given
/// - `continuation` (bool): the content directly continues prior material
/// - `sequence_index` (number): position in a producer-side chunk sequence;
///   its presence also implies continuation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopMetadata {
    record: Map<String, Value>,
}

impl LoopMetadata {
    pub fn new(record: Map<String, Value>) -> Self {
        Self { record }
    }

    /// Empty record
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set a key (builder style, mostly for tests and the demo)
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.record.insert(key.to_string(), value.into());
        self
    }

    /// Raw access to the underlying record (pass-through keys included)
    pub fn record(&self) -> &Map<String, Value> {
        &self.record
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.record.get(key).and_then(Value::as_f64)
    }

    /// Explicit beat length, if present (`beats`, else `bars` x 4)
    pub fn explicit_beats(&self) -> Option<f64> {
        self.number("beats")
            .or_else(|| self.number("bars").map(|b| b * BEATS_PER_BAR))
            .filter(|b| *b > 0.0)
    }

    /// Tempo hint in BPM, if present
    pub fn bpm_hint(&self) -> Option<f64> {
        self.number("bpm_hint").filter(|b| *b > 0.0)
    }

    /// Producer-side sequence index, if present
    pub fn sequence_index(&self) -> Option<u64> {
        self.record.get("sequence_index").and_then(Value::as_u64)
    }

    /// Whether this content is a direct temporal continuation of prior
    /// material (explicit flag, or implied by a sequence index)
    pub fn is_continuation(&self) -> bool {
        self.record
            .get("continuation")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || self.sequence_index().is_some()
    }
}

/// An immutable decoded audio loop with a known length in beats
#[derive(Debug)]
pub struct LoopBuffer {
    id: LoopId,
    stream: StreamId,
    samples: StereoBuffer,
    sample_rate: u32,
    beats: f64,
}

impl LoopBuffer {
    /// Build a loop from decoded audio and metadata
    ///
    /// Fails with `EmptyLoop` on a zero-frame buffer and `BadMetadata` on a
    /// non-positive derived beat length; no state is mutated on failure.
    pub fn new(
        stream: StreamId,
        samples: StereoBuffer,
        sample_rate: u32,
        metadata: &LoopMetadata,
    ) -> EngineResult<Self> {
        if samples.is_empty() {
            return Err(EngineError::EmptyLoop(stream));
        }

        let beats = Self::derive_beats(&samples, sample_rate, metadata)?;

        Ok(Self {
            id: LoopId::next(),
            stream,
            samples,
            sample_rate,
            beats,
        })
    }

    /// Beat length: explicit count, else BPM hint x duration, else default
    fn derive_beats(
        samples: &StereoBuffer,
        sample_rate: u32,
        metadata: &LoopMetadata,
    ) -> EngineResult<f64> {
        if let Some(beats) = metadata.explicit_beats() {
            return Ok(beats);
        }

        if let Some(bpm) = metadata.bpm_hint() {
            let duration = samples.len() as f64 / sample_rate as f64;
            let beats = (duration * bpm / 60.0).round();
            if beats < 1.0 {
                return Err(EngineError::BadMetadata(format!(
                    "bpm_hint {} over {:.3}s yields no whole beat",
                    bpm, duration
                )));
            }
            return Ok(beats);
        }

        Ok(DEFAULT_LOOP_BEATS)
    }

    #[inline]
    pub fn id(&self) -> LoopId {
        self.id
    }

    #[inline]
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    #[inline]
    pub fn beats(&self) -> f64 {
        self.beats
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length in frames (never zero)
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn duration_seconds(&self) -> f64 {
        self.frame_len() as f64 / self.sample_rate as f64
    }

    #[inline]
    pub fn samples(&self) -> &StereoBuffer {
        &self.samples
    }

    /// Sample at a frame position, wrapping around the loop end
    #[inline]
    pub fn sample_wrapped(&self, frame: usize) -> crate::types::StereoSample {
        self.samples[frame % self.frame_len()]
    }
}

//! CPAL output backend
//!
//! ```text
//! ┌──────────────────┐                    ┌─────────────────────┐
//! │  App / control   │──EngineCommand────►│   Command Ring      │
//! │  plane threads   │                    │  (lock-free SPSC)   │
//! └──────────────────┘                    └──────────┬──────────┘
//!         ▲                                          │ pop()
//!         │ EngineEvent / atomics                    ▼
//! ┌───────┴──────────┐                    ┌─────────────────────┐
//! │ Scheduler thread │◄──RenderEvent──────│  CPAL audio thread  │
//! │  (~50 Hz tick)   │                    │  (owns LoopEngine)  │
//! └──────────────────┘                    └─────────────────────┘
//! ```
//!
//! The callback also feeds the [`DeviceClock`]: every rendered buffer
//! advances the frame counter the control plane converts beats against.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use crate::clock::{Clock, DeviceClock};
use crate::config::EngineConfig;
use crate::engine::{EngineController, LoopEngine, MAX_BUFFER_SIZE};
use crate::types::StereoBuffer;

use super::error::{AudioError, AudioResult};

/// Keeps the output stream alive; drop to stop audio
pub struct AudioHandle {
    _stream: Stream,
    sample_rate: u32,
    channels: u16,
}

impl AudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Result of starting the audio system
pub struct AudioSystem {
    /// Keep this alive for as long as audio should run
    pub handle: AudioHandle,
    /// The engine API (submit loops, start/stop, effects, stutter)
    pub controller: EngineController,
    /// The device clock shared with the controller
    pub clock: Arc<DeviceClock>,
}

/// Start the engine against the default output device
pub fn start_audio_system(config: EngineConfig) -> AudioResult<AudioSystem> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevices)?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{:?}",
            supported.sample_format()
        )));
    }

    let channels = supported.channels();
    if channels < 2 {
        return Err(AudioError::NotStereo(channels));
    }
    let sample_rate = supported.sample_rate().0;
    let stream_config: StreamConfig = supported.config();

    log::info!(
        "audio: {} @ {}Hz, {} channels",
        device.name().unwrap_or_else(|_| "<unknown>".into()),
        sample_rate,
        channels
    );

    let clock = Arc::new(DeviceClock::new(sample_rate));
    let writer = clock.writer();
    let (controller, engine) =
        EngineController::new(config, Arc::clone(&clock) as Arc<dyn Clock>);

    let stream = build_output_stream(&device, &stream_config, engine, writer, channels)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok(AudioSystem {
        handle: AudioHandle {
            _stream: stream,
            sample_rate,
            channels,
        },
        controller,
        clock,
    })
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: LoopEngine,
    writer: crate::clock::DeviceClockWriter,
    channels: u16,
) -> AudioResult<Stream> {
    // Pre-allocated; the callback only adjusts its working length
    let mut render_buffer = StereoBuffer::silence(MAX_BUFFER_SIZE);
    let channels = channels as usize;
    let err_writer = writer.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _| {
                let frames = data.len() / channels;
                render_buffer.set_len_from_capacity(frames);

                engine.process(&mut render_buffer);

                if channels == 2 {
                    data.copy_from_slice(render_buffer.as_interleaved());
                } else {
                    // Stereo into the first pair, silence elsewhere
                    for (frame_idx, frame) in data.chunks_exact_mut(channels).enumerate() {
                        let sample = render_buffer[frame_idx];
                        frame[0] = sample.left;
                        frame[1] = sample.right;
                        for extra in frame.iter_mut().skip(2) {
                            *extra = 0.0;
                        }
                    }
                }

                writer.advance(frames as u64);
            },
            move |err| {
                // Scheduling falls back to fixed short leads while down
                err_writer.mark_down();
                log::error!("audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

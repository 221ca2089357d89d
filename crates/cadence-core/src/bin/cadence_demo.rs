//! Headless demo: synthesizes two loops in memory and drives the engine
//!
//! No files are read or written; a drum loop and a chord loop are generated
//! programmatically, started in sync, then hot-swapped, swept, and stuttered
//! so every engine feature can be heard on the default output device.

use std::f32::consts::TAU;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use cadence_core::audio::start_audio_system;
use cadence_core::config::{default_config_path, load_config};
use cadence_core::events::EngineEvent;
use cadence_core::loops::LoopMetadata;
use cadence_core::types::{StereoBuffer, StereoSample, StreamId};

const BPM: f64 = 120.0;
const BEATS: f64 = 16.0;

/// A 16-beat kick/hat pattern
fn drum_loop(sample_rate: u32) -> StereoBuffer {
    let frames_per_beat = (sample_rate as f64 * 60.0 / BPM) as usize;
    let total = frames_per_beat * BEATS as usize;
    let mut samples = vec![StereoSample::silence(); total];

    for beat in 0..BEATS as usize {
        let start = beat * frames_per_beat;

        // Kick: decaying 55Hz sine burst on every beat
        for i in 0..(sample_rate as usize / 8).min(total - start) {
            let t = i as f32 / sample_rate as f32;
            let env = (-t * 30.0).exp();
            let value = (TAU * 55.0 * t).sin() * env * 0.8;
            samples[start + i] += StereoSample::mono(value);
        }

        // Hat: short noise burst on the off-beat
        let hat_start = start + frames_per_beat / 2;
        let mut noise_state = 0x9e37_79b9_u32.wrapping_add(beat as u32);
        for i in 0..(sample_rate as usize / 40).min(total - hat_start) {
            noise_state = noise_state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = (noise_state >> 16) as f32 / 32_768.0 - 1.0;
            let env = (-(i as f32 / sample_rate as f32) * 120.0).exp();
            samples[hat_start + i] += StereoSample::mono(noise * env * 0.2);
        }
    }

    StereoBuffer::from_vec(samples)
}

/// A 16-beat two-chord pad
fn chord_loop(sample_rate: u32, root_hz: f32) -> StereoBuffer {
    let frames_per_beat = (sample_rate as f64 * 60.0 / BPM) as usize;
    let total = frames_per_beat * BEATS as usize;
    let half = total / 2;
    let mut samples = vec![StereoSample::silence(); total];

    for (i, sample) in samples.iter_mut().enumerate() {
        let t = i as f32 / sample_rate as f32;
        // Minor triad, up a fourth for the second half
        let shift = if i < half { 1.0 } else { 4.0 / 3.0 };
        let mut value = 0.0;
        for ratio in [1.0f32, 1.1892, 1.4983] {
            value += (TAU * root_hz * ratio * shift * t).sin();
        }
        *sample = StereoSample::mono(value / 3.0 * 0.25);
    }

    StereoBuffer::from_vec(samples)
}

fn main() -> Result<()> {
    env_logger::init();

    let config = load_config(&default_config_path());
    let system = start_audio_system(config).context("failed to start audio output")?;
    let controller = &system.controller;
    let sample_rate = system.handle.sample_rate();
    let events = controller.subscribe();

    // Print what actually happens, as the engine reports it
    thread::spawn(move || {
        for event in events {
            match event {
                EngineEvent::LoopSwitched {
                    stream,
                    audible_seconds,
                    ..
                } => println!("[{:8.3}s] {} switched", audible_seconds, stream.name()),
                EngineEvent::StutterStarted { at_seconds } => {
                    println!("[{:8.3}s] stutter on", at_seconds)
                }
                EngineEvent::StutterStopped { at_seconds } => {
                    println!("[{:8.3}s] stutter off", at_seconds)
                }
                _ => {}
            }
        }
    });

    let meta = LoopMetadata::empty().with("beats", BEATS).with("bpm_hint", BPM);

    controller.set_bpm(BPM)?;
    controller.submit_loop(StreamId::Rhythm, drum_loop(sample_rate), sample_rate, meta.clone())?;
    controller.submit_loop(StreamId::Melodic, chord_loop(sample_rate, 220.0), sample_rate, meta.clone())?;
    controller.set_reverb_mix(StreamId::Rhythm, 0.08)?;

    println!("starting playback ({} bpm, {} beats per loop)", BPM, BEATS);
    controller.start()?;
    thread::sleep(Duration::from_secs(8));

    println!("queueing a new chord loop (crossfade on the next boundary)");
    let continuation = meta.clone().with("continuation", true);
    controller.submit_loop(StreamId::Melodic, chord_loop(sample_rate, 174.6), sample_rate, continuation)?;
    thread::sleep(Duration::from_secs(10));

    println!("sweeping the melodic filter");
    controller.set_lfo_enabled(true)?;
    thread::sleep(Duration::from_secs(8));
    controller.set_lfo_enabled(false)?;

    println!("engaging stutter for two seconds");
    controller.stutter_engage()?;
    thread::sleep(Duration::from_secs(2));
    controller.stutter_release()?;
    thread::sleep(Duration::from_secs(4));

    println!("stopping");
    controller.stop()?;
    thread::sleep(Duration::from_millis(200));
    Ok(())
}

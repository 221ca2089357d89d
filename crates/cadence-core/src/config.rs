//! Engine configuration
//!
//! Every timing and DSP tunable named in the engine lives here, so a whole
//! deployment can be described by one YAML file. Loading falls back to
//! defaults on a missing or unparseable file; saving creates parent
//! directories as needed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Scheduling and seam timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Control-plane scheduler tick period in seconds (~50 Hz)
    pub tick_seconds: f64,
    /// Lead window for promoting pending switches, in seconds
    pub switch_lead_seconds: f64,
    /// Lead used on the very first start after engine creation (device warm-up)
    pub first_start_lead_seconds: f64,
    /// Lead used on subsequent starts
    pub start_lead_seconds: f64,
    /// Fallback lead when the device clock is momentarily unreadable
    pub fallback_lead_seconds: f64,
    /// Distance in beats under which two pending switches count as simultaneous.
    /// None = use the promotion lead window converted to beats.
    pub dual_switch_tolerance_beats: Option<f64>,
    /// Equal-power crossfade duration for continuation seams, in seconds
    pub crossfade_seconds: f64,
    /// De-click fade-in applied to hard-cut seams, in seconds
    pub hard_cut_ramp_seconds: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 0.02,
            switch_lead_seconds: 0.06,
            first_start_lead_seconds: 0.35,
            start_lead_seconds: 0.05,
            fallback_lead_seconds: 0.04,
            dual_switch_tolerance_beats: None,
            crossfade_seconds: 0.025,
            hard_cut_ramp_seconds: 0.004,
        }
    }
}

/// LFO sweep shape and behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfoConfig {
    /// Length of one sweep cycle in beats
    pub cycle_beats: f64,
    /// Fraction of the cycle held at the minimum before the rise
    pub low_hold_fraction: f64,
    /// Fraction of the cycle spent rising (smoothstep eased)
    pub rise_fraction: f64,
    /// Fraction of the cycle held at the maximum
    pub high_hold_fraction: f64,
    /// Sweep floor in Hz
    pub min_hz: f32,
    /// Sweep ceiling in Hz (the live-adjustable "max" endpoint default)
    pub max_hz: f32,
    /// Time constant of the max-endpoint smoother in seconds
    pub target_smoothing_seconds: f32,
    /// Ramp back to the pre-LFO cutoff on disable, in seconds
    pub release_seconds: f32,
}

impl Default for LfoConfig {
    fn default() -> Self {
        Self {
            cycle_beats: 4.0,
            low_hold_fraction: 0.35,
            rise_fraction: 0.1,
            high_hold_fraction: 0.35,
            min_hz: 220.0,
            max_hz: 12_000.0,
            target_smoothing_seconds: 0.03,
            release_seconds: 0.12,
        }
    }
}

/// Transient preference for stutter slice selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StutterFocus {
    /// Low-frequency biased (kick hits)
    Kick,
    /// High-frequency biased (snare hits)
    Snare,
    /// Balanced blend
    #[default]
    Auto,
}

/// What happens to the real rhythm voice while the stutter runs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StutterDuck {
    /// Silence the rhythm voice entirely
    Replace,
    /// Keep it at the given linear gain
    Duck(f32),
}

impl Default for StutterDuck {
    fn default() -> Self {
        StutterDuck::Replace
    }
}

/// Stutter effect tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StutterConfig {
    /// Sub-beat grid size in beats (0.25 = sixteenth at 4/4)
    pub grid_beats: f64,
    /// Transient search window around the grid position, in seconds (each way)
    pub search_window_seconds: f64,
    /// Absolute RMS floor below which the local search falls back to the whole loop
    pub loudness_floor: f32,
    /// Transient preference
    pub focus: StutterFocus,
    /// Rhythm voice policy while stuttering
    pub duck: StutterDuck,
    /// Number of one-shot repetitions pre-scheduled on engage
    pub max_pulses: usize,
    /// Fade-in applied to the extracted slice, in seconds
    pub slice_fade_seconds: f64,
    /// Pre-fade before the release boundary, in seconds (capped to a fraction of a pulse)
    pub release_fade_seconds: f64,
    /// Reverb wet level the bloom ramps toward
    pub bloom_wet: f32,
    /// Number of pulses over which the bloom ramp runs
    pub bloom_pulses: usize,
}

impl Default for StutterConfig {
    fn default() -> Self {
        Self {
            grid_beats: 0.25,
            search_window_seconds: 0.03,
            loudness_floor: 0.02,
            focus: StutterFocus::Auto,
            duck: StutterDuck::Replace,
            max_pulses: 64,
            slice_fade_seconds: 0.003,
            release_fade_seconds: 0.02,
            bloom_wet: 0.55,
            bloom_pulses: 8,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timing: TimingConfig,
    pub lfo: LfoConfig,
    pub stutter: StutterConfig,
}

impl EngineConfig {
    /// Resolved dual-switch tolerance in beats at the given BPM
    pub fn dual_tolerance_beats(&self, bpm: f64) -> f64 {
        self.timing
            .dual_switch_tolerance_beats
            .unwrap_or(self.timing.switch_lead_seconds * bpm / 60.0)
    }
}

/// Default config file location (`$XDG_CONFIG_HOME/cadence/engine.yaml`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence")
        .join("engine.yaml")
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist or fails to parse, logs and returns defaults.
pub fn load_config(path: &Path) -> EngineConfig {
    if !path.exists() {
        log::info!("load_config: {:?} doesn't exist, using defaults", path);
        return EngineConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<EngineConfig>(&contents) {
            Ok(config) => {
                log::info!("load_config: loaded {:?}", path);
                config
            }
            Err(e) => {
                log::warn!("load_config: failed to parse config: {}, using defaults", e);
                EngineConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: failed to read config file: {}, using defaults", e);
            EngineConfig::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories as needed
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: saved {:?}", path);
    Ok(())
}

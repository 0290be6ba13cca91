use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::analysis::{OnsetConfig, PipelineConfig, TempoConfig};
use crate::engine::EngineConfig;

/// File-level settings (`beatstroke.toml`). Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub onset: OnsetSection,
    #[serde(default)]
    pub tempo: TempoSection,
    #[serde(default)]
    pub amplitude: AmplitudeSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Deserialize)]
pub struct OnsetSection {
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_hop_size")]
    pub hop_size: usize,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
}

#[derive(Debug, Deserialize)]
pub struct TempoSection {
    #[serde(default = "default_min_bpm")]
    pub min_bpm: f64,
    #[serde(default = "default_max_bpm")]
    pub max_bpm: f64,
}

#[derive(Debug, Deserialize)]
pub struct AmplitudeSection {
    /// Live loudness window
    #[serde(default = "default_window_ms")]
    pub window_ms: f64,
    /// Loudness envelope resolution stored in the beat map
    #[serde(default = "default_envelope_window_ms")]
    pub envelope_window_ms: f64,
}

#[derive(Debug, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_axis")]
    pub axis: String,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: f64,
}

impl Default for OnsetSection {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
            hop_size: default_hop_size(),
            sensitivity: default_sensitivity(),
            noise_floor: default_noise_floor(),
        }
    }
}

impl Default for TempoSection {
    fn default() -> Self {
        Self {
            min_bpm: default_min_bpm(),
            max_bpm: default_max_bpm(),
        }
    }
}

impl Default for AmplitudeSection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            envelope_window_ms: default_envelope_window_ms(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            axis: default_axis(),
            ring_capacity: default_ring_capacity(),
            lookahead_ms: default_lookahead_ms(),
        }
    }
}

fn default_fft_size() -> usize { 1024 }
fn default_hop_size() -> usize { 512 }
fn default_sensitivity() -> f64 { 1.5 }
fn default_noise_floor() -> f64 { 0.01 }
fn default_min_bpm() -> f64 { 50.0 }
fn default_max_bpm() -> f64 { 180.0 }
fn default_window_ms() -> f64 { 50.0 }
fn default_envelope_window_ms() -> f64 { 20.0 }
fn default_axis() -> String { "L0".into() }
fn default_ring_capacity() -> usize { 48_000 }
fn default_lookahead_ms() -> f64 { 5000.0 }

impl Config {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            onset: OnsetConfig {
                fft_size: self.onset.fft_size,
                hop_size: self.onset.hop_size,
                sensitivity: self.onset.sensitivity,
                noise_floor: self.onset.noise_floor,
            },
            tempo: TempoConfig {
                min_bpm: self.tempo.min_bpm,
                max_bpm: self.tempo.max_bpm,
                ..TempoConfig::default()
            },
            envelope_window_ms: self.amplitude.envelope_window_ms,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            axis: self.engine.axis.clone(),
            ring_capacity: self.engine.ring_capacity,
            live_window_ms: self.amplitude.window_ms,
            lookahead_ms: self.engine.lookahead_ms,
            ..EngineConfig::default()
        }
    }
}

/// Explicit path, else `./beatstroke.toml`, else the user config directory.
pub fn find_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        let local = PathBuf::from("beatstroke.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("beatstroke").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("beatstroke").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    })
}

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(err) => {
            log::warn!("Invalid config {}: {}", path.display(), err);
            None
        }
    }
}

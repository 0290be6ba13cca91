//! Streaming spectral-flux onset detection.
//!
//! Samples are buffered until a full FFT frame is available. Each frame is
//! Hann windowed and transformed; the positive change in magnitude against the
//! previous frame (spectral flux) is compared with an adaptive threshold
//! derived from the last half second of flux values.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::features::BeatEvent;
use crate::error::{Error, Result};

/// Rolling threshold window length.
const THRESHOLD_WINDOW_MS: f64 = 500.0;
/// Echoes of one transient closer than this are not separate onsets.
pub const MIN_ONSET_INTERVAL_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetConfig {
    /// Power of two, at least 2
    pub fft_size: usize,
    /// 1..=fft_size
    pub hop_size: usize,
    /// Multiplier on the rolling mean flux
    pub sensitivity: f64,
    /// Absolute flux below which nothing fires
    pub noise_floor: f64,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            fft_size: 1024,
            hop_size: 512,
            sensitivity: 1.5,
            noise_floor: 0.01,
        }
    }
}

impl OnsetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 2 || !self.fft_size.is_power_of_two() {
            return Err(Error::config(format!(
                "fft size must be a power of two >= 2, got {}",
                self.fft_size
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.fft_size {
            return Err(Error::config(format!(
                "hop size must be in 1..={}, got {}",
                self.fft_size, self.hop_size
            )));
        }
        if !(self.sensitivity > 0.0) || !self.sensitivity.is_finite() {
            return Err(Error::config(format!(
                "sensitivity must be positive, got {}",
                self.sensitivity
            )));
        }
        if !(self.noise_floor >= 0.0) {
            return Err(Error::config("noise floor must not be negative"));
        }
        Ok(())
    }
}

pub struct OnsetDetector {
    config: OnsetConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    frame: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    prev_magnitudes: Vec<f32>,
    has_baseline: bool,
    /// Samples not yet consumed by a full frame
    pending: Vec<f32>,
    /// Media time of `pending[0]`
    pending_start_ms: f64,
    sample_rate: u32,
    flux_history: VecDeque<f64>,
    flux_sum: f64,
    history_len: usize,
    last_onset_ms: Option<f64>,
}

impl OnsetDetector {
    pub fn new(config: OnsetConfig) -> Result<Self> {
        config.validate()?;

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.fft_size);
        let bins = config.fft_size / 2;

        Ok(Self {
            config,
            fft,
            window: hann_window(config.fft_size),
            frame: vec![Complex::new(0.0, 0.0); config.fft_size],
            magnitudes: vec![0.0; bins],
            prev_magnitudes: vec![0.0; bins],
            has_baseline: false,
            pending: Vec::with_capacity(config.fft_size * 2),
            pending_start_ms: 0.0,
            sample_rate: 0,
            flux_history: VecDeque::new(),
            flux_sum: 0.0,
            history_len: 1,
            last_onset_ms: None,
        })
    }

    pub fn config(&self) -> &OnsetConfig {
        &self.config
    }

    /// Clear all carried state so the next call starts a new stream.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_start_ms = 0.0;
        self.prev_magnitudes.iter_mut().for_each(|m| *m = 0.0);
        self.has_baseline = false;
        self.flux_history.clear();
        self.flux_sum = 0.0;
        self.last_onset_ms = None;
        self.sample_rate = 0;
    }

    /// Feed a chunk of mono samples starting at `start_ms` on the media
    /// timeline, returning any onsets found in the frames it completes.
    pub fn process(
        &mut self,
        samples: &[f32],
        start_ms: f64,
        sample_rate: u32,
    ) -> Result<Vec<BeatEvent>> {
        self.run(samples, start_ms, sample_rate, None)
    }

    /// Like [`process`](Self::process) but gives up with
    /// [`Error::Cancelled`] as soon as `cancel` is set (checked per frame).
    pub fn process_cancellable(
        &mut self,
        samples: &[f32],
        start_ms: f64,
        sample_rate: u32,
        cancel: &AtomicBool,
    ) -> Result<Vec<BeatEvent>> {
        self.run(samples, start_ms, sample_rate, Some(cancel))
    }

    fn run(
        &mut self,
        samples: &[f32],
        start_ms: f64,
        sample_rate: u32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<BeatEvent>> {
        if sample_rate == 0 {
            return Err(Error::config("sample rate must be positive"));
        }
        if sample_rate != self.sample_rate {
            if self.sample_rate != 0 {
                log::debug!(
                    "Sample rate changed {} -> {}, restarting onset stream",
                    self.sample_rate,
                    sample_rate
                );
            }
            self.reset();
            self.sample_rate = sample_rate;
            let hops_per_second = sample_rate as f64 / self.config.hop_size as f64;
            self.history_len =
                ((THRESHOLD_WINDOW_MS / 1000.0 * hops_per_second).ceil() as usize).max(1);
        }

        let ms_per_sample = 1000.0 / sample_rate as f64;
        // Anchor the buffered samples to the caller's timeline.
        self.pending_start_ms = start_ms - self.pending.len() as f64 * ms_per_sample;
        self.pending.extend_from_slice(samples);

        let fft_size = self.config.fft_size;
        let hop = self.config.hop_size;
        // New audio in each frame begins this far past the frame start.
        let onset_offset_ms = (fft_size - hop) as f64 * ms_per_sample;

        let mut onsets = Vec::new();
        let mut pos = 0;
        while self.pending.len() - pos >= fft_size {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                self.consume(pos, ms_per_sample);
                return Err(Error::Cancelled);
            }

            let frame_ms = self.pending_start_ms + pos as f64 * ms_per_sample;
            if let Some(onset) = self.analyze_frame(pos, frame_ms + onset_offset_ms) {
                onsets.push(onset);
            }
            pos += hop;
        }
        self.consume(pos, ms_per_sample);

        Ok(onsets)
    }

    fn consume(&mut self, count: usize, ms_per_sample: f64) {
        self.pending.drain(..count);
        self.pending_start_ms += count as f64 * ms_per_sample;
    }

    fn analyze_frame(&mut self, pos: usize, time_ms: f64) -> Option<BeatEvent> {
        let fft_size = self.config.fft_size;
        for ((slot, &s), &w) in self
            .frame
            .iter_mut()
            .zip(&self.pending[pos..pos + fft_size])
            .zip(&self.window)
        {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.frame);

        let norm = 2.0 / fft_size as f32;
        for (mag, c) in self.magnitudes.iter_mut().zip(&self.frame) {
            *mag = c.norm() * norm;
        }

        if !self.has_baseline {
            self.has_baseline = true;
            std::mem::swap(&mut self.magnitudes, &mut self.prev_magnitudes);
            return None;
        }

        let flux: f64 = self
            .magnitudes
            .iter()
            .zip(&self.prev_magnitudes)
            .map(|(cur, prev)| (cur - prev).max(0.0) as f64)
            .sum();
        std::mem::swap(&mut self.magnitudes, &mut self.prev_magnitudes);

        self.flux_history.push_back(flux);
        self.flux_sum += flux;
        while self.flux_history.len() > self.history_len {
            if let Some(old) = self.flux_history.pop_front() {
                self.flux_sum -= old;
            }
        }
        let mean = (self.flux_sum / self.flux_history.len() as f64).max(0.0);
        let threshold = mean * self.config.sensitivity;

        if flux <= threshold || flux <= self.config.noise_floor {
            return None;
        }
        if let Some(last) = self.last_onset_ms {
            if time_ms - last < MIN_ONSET_INTERVAL_MS {
                return None;
            }
        }

        self.last_onset_ms = Some(time_ms);
        let strength = if threshold > 0.0 {
            (flux / (threshold * 2.0)).min(1.0)
        } else {
            1.0
        };
        Some(BeatEvent {
            timestamp_ms: time_ms,
            strength,
            is_quantized: false,
        })
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

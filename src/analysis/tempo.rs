//! Tempo estimation from an onset stream.
//!
//! Inter-beat intervals vote into a BPM histogram. Each interval also votes
//! for its harmonics so that missed detections (interval twice the real
//! period) and double triggers (half the period) still reinforce the true
//! tempo. The weights below are tuned by ear, not derived.

use std::collections::VecDeque;

use super::features::BpmEstimate;
use crate::error::{Error, Result};

/// (tempo multiplier, vote weight). Fundamental first.
const HARMONICS: [(f64, f64); 4] = [
    (1.0, 1.0),
    // interval is 2x the period (missed beat)
    (0.5, 0.25),
    // interval is 3x the period
    (1.0 / 3.0, 0.15),
    // interval is half the period (double trigger)
    (2.0, 0.3),
];

/// Gaussian spread of each vote, in histogram bins.
const VOTE_SIGMA: f64 = 1.0;
/// Width of one histogram bin in BPM.
const BIN_WIDTH: f64 = 1.0;
/// Bins either side of the peak that count towards confidence.
const PEAK_SPREAD: usize = 2;
/// Intervals needed before confidence may reach its full value.
const FULL_CONFIDENCE_INTERVALS: usize = 8;
/// Weight of each new candidate in the running estimate.
const SMOOTHING: f64 = 0.15;
/// Below this confidence beats are never snapped to the grid.
pub const QUANTIZE_MIN_CONFIDENCE: f64 = 0.6;
/// Beats further than this from the nearest grid line are left alone.
pub const QUANTIZE_TOLERANCE_MS: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoConfig {
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Number of beat timestamps remembered
    pub history: usize,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            min_bpm: 50.0,
            max_bpm: 180.0,
            history: 32,
        }
    }
}

impl TempoConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_bpm > 0.0) || !self.min_bpm.is_finite() {
            return Err(Error::config(format!(
                "minimum BPM must be positive, got {}",
                self.min_bpm
            )));
        }
        if !(self.max_bpm > self.min_bpm) || !self.max_bpm.is_finite() {
            return Err(Error::config(format!(
                "maximum BPM {} must exceed minimum {}",
                self.max_bpm, self.min_bpm
            )));
        }
        if self.history < 3 {
            return Err(Error::config("tempo history must hold at least 3 beats"));
        }
        Ok(())
    }
}

pub struct BpmEstimator {
    config: TempoConfig,
    last_timestamp: Option<f64>,
    intervals: VecDeque<f64>,
    histogram: Vec<f64>,
    estimate: BpmEstimate,
}

impl BpmEstimator {
    pub fn new(config: TempoConfig) -> Result<Self> {
        config.validate()?;
        let bins = ((config.max_bpm - config.min_bpm) / BIN_WIDTH).ceil() as usize + 1;
        Ok(Self {
            config,
            last_timestamp: None,
            intervals: VecDeque::with_capacity(config.history),
            histogram: vec![0.0; bins],
            estimate: BpmEstimate::default(),
        })
    }

    pub fn estimate(&self) -> BpmEstimate {
        self.estimate
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn reset(&mut self) {
        self.last_timestamp = None;
        self.intervals.clear();
        self.estimate = BpmEstimate::default();
    }

    /// Record a beat. Returns the updated estimate once at least two
    /// intervals have been seen.
    pub fn add_beat(&mut self, timestamp_ms: f64) -> Option<BpmEstimate> {
        if let Some(last) = self.last_timestamp {
            let interval = timestamp_ms - last;
            if !(interval > 0.0) {
                return None;
            }
            // N timestamps give N-1 intervals.
            if self.intervals.len() == self.config.history - 1 {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval);
        }
        self.last_timestamp = Some(timestamp_ms);

        if self.intervals.len() < 2 {
            return None;
        }

        let (candidate, confidence) = self.vote()?;
        let bpm = if self.estimate.is_determined() {
            self.estimate.bpm + SMOOTHING * (candidate - self.estimate.bpm)
        } else {
            candidate
        };
        let period = 60_000.0 / bpm;

        self.estimate = BpmEstimate {
            bpm,
            confidence,
            phase_offset_ms: timestamp_ms.rem_euclid(period),
        };
        log::trace!(
            "tempo: candidate {:.2}, smoothed {:.2}, confidence {:.2}",
            candidate,
            bpm,
            confidence
        );
        Some(self.estimate)
    }

    /// Snap `raw_ms` to the beat grid when the estimate is trustworthy and
    /// the beat is close to a grid line; otherwise return it unchanged.
    pub fn quantize_beat(&self, raw_ms: f64) -> f64 {
        self.snap(raw_ms).unwrap_or(raw_ms)
    }

    /// The grid line `raw_ms` snaps to, if any.
    pub fn snap(&self, raw_ms: f64) -> Option<f64> {
        if self.estimate.confidence < QUANTIZE_MIN_CONFIDENCE {
            return None;
        }
        let period = self.estimate.period_ms()?;
        let phase = self.estimate.phase_offset_ms;
        let grid = phase + ((raw_ms - phase) / period).round() * period;
        ((grid - raw_ms).abs() <= QUANTIZE_TOLERANCE_MS).then_some(grid)
    }

    /// Build the vote histogram and return (candidate BPM, confidence).
    fn vote(&mut self) -> Option<(f64, f64)> {
        let min_bpm = self.config.min_bpm;
        let bins = self.histogram.len();
        self.histogram.iter_mut().for_each(|v| *v = 0.0);

        let n = self.intervals.len();
        let reach = (VOTE_SIGMA * 4.0).ceil() as isize;
        for (k, &interval) in self.intervals.iter().enumerate() {
            // Oldest interval votes at half the weight of the newest.
            let recency = 0.5 + 0.5 * k as f64 / (n - 1) as f64;
            let base = 60_000.0 / interval;
            if !base.is_finite() {
                continue;
            }

            for &(multiplier, weight) in &HARMONICS {
                let position = (base * multiplier - min_bpm) / BIN_WIDTH;
                // Too far off the histogram to reach any bin.
                if !(position >= -(reach as f64) && position <= (bins as isize + reach) as f64) {
                    continue;
                }
                let centre = position.round() as isize;
                for bin in (centre - reach)..=(centre + reach) {
                    if bin < 0 || bin as usize >= bins {
                        continue;
                    }
                    let d = bin as f64 - position;
                    self.histogram[bin as usize] +=
                        weight * recency * (-(d * d) / (2.0 * VOTE_SIGMA * VOTE_SIGMA)).exp();
                }
            }
        }

        let total: f64 = self.histogram.iter().sum();
        if total <= f64::EPSILON {
            return None;
        }

        let (peak, _) = self
            .histogram
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;

        let mut offset = 0.0;
        if peak > 0 && peak + 1 < bins {
            let (y0, y1, y2) = (
                self.histogram[peak - 1],
                self.histogram[peak],
                self.histogram[peak + 1],
            );
            let denom = y0 - 2.0 * y1 + y2;
            if denom.abs() > f64::EPSILON {
                offset = (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5);
            }
        }
        let candidate = min_bpm + (peak as f64 + offset) * BIN_WIDTH;

        let lo = peak.saturating_sub(PEAK_SPREAD);
        let hi = (peak + PEAK_SPREAD).min(bins - 1);
        let near: f64 = self.histogram[lo..=hi].iter().sum();
        let evidence = (n as f64 / FULL_CONFIDENCE_INTERVALS as f64).min(1.0);
        let confidence = (near / total * evidence).clamp(0.0, 1.0);

        Some((candidate, confidence))
    }
}

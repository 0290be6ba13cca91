//! Full-track analysis: decoder → onset detection → tempo → loudness → [`BeatMap`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::features::{BeatEvent, BeatMap};
use super::onset::{OnsetConfig, OnsetDetector};
use super::tempo::{BpmEstimator, TempoConfig};
use crate::audio::{AmplitudeTracker, MediaDecoder};
use crate::error::{Error, Result};

/// Two beats closer than this after snapping are the same beat.
const DUPLICATE_BEAT_MS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub onset: OnsetConfig,
    pub tempo: TempoConfig,
    /// RMS window of the stored loudness envelope
    pub envelope_window_ms: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            onset: OnsetConfig::default(),
            tempo: TempoConfig::default(),
            envelope_window_ms: 20.0,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.onset.validate()?;
        self.tempo.validate()?;
        AmplitudeTracker::new(self.envelope_window_ms)?;
        Ok(())
    }
}

pub struct AnalysisPipeline {
    config: PipelineConfig,
    decoder: Arc<dyn MediaDecoder>,
}

impl AnalysisPipeline {
    pub fn new(config: PipelineConfig, decoder: Arc<dyn MediaDecoder>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, decoder })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Analyze `path` to completion.
    ///
    /// `progress` receives `min(1, chunk_start / total_duration)` after each
    /// chunk when the duration is known. Returns [`Error::Cancelled`] as soon
    /// as `cancel` is observed; no partial map is ever returned.
    pub fn run(
        &self,
        path: &Path,
        cancel: &Arc<AtomicBool>,
        mut progress: impl FnMut(f32),
    ) -> Result<BeatMap> {
        log::info!("Analyzing {}", path.display());

        let mut detector = OnsetDetector::new(self.config.onset)?;
        let mut estimator = BpmEstimator::new(self.config.tempo)?;
        let mut loudness = AmplitudeTracker::new(self.config.envelope_window_ms)?;

        let mut raw_beats: Vec<BeatEvent> = Vec::new();
        let mut envelope: Vec<f32> = Vec::new();
        let mut duration_ms = 0.0f64;
        let mut chunks = 0usize;

        for chunk in self.decoder.decode(path, Arc::clone(cancel))? {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let chunk = chunk?;
            if chunk.sample_rate == 0 {
                return Err(Error::AnalysisFailure(
                    "decoder produced a chunk without a sample rate".into(),
                ));
            }
            chunks += 1;

            let onsets = detector.process_cancellable(
                &chunk.samples,
                chunk.start_ms,
                chunk.sample_rate,
                cancel,
            )?;
            for onset in onsets {
                estimator.add_beat(onset.timestamp_ms);
                raw_beats.push(onset);
            }

            envelope.extend(
                loudness
                    .process(&chunk.samples, chunk.start_ms, chunk.sample_rate)?
                    .into_iter()
                    .map(|(_, rms)| rms),
            );

            let chunk_end =
                chunk.start_ms + chunk.samples.len() as f64 * 1000.0 / chunk.sample_rate as f64;
            duration_ms = duration_ms.max(chunk.total_duration_ms).max(chunk_end);

            if chunk.total_duration_ms > 0.0 {
                progress(((chunk.start_ms / chunk.total_duration_ms) as f32).clamp(0.0, 1.0));
            }
            log::debug!(
                "chunk {} @ {:.0} ms: {} beats so far",
                chunks,
                chunk.start_ms,
                raw_beats.len()
            );
        }

        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let estimate = estimator.estimate();
        let beats = lock_to_grid(&estimator, raw_beats);
        let quantized = beats.iter().filter(|b| b.is_quantized).count();
        progress(1.0);

        log::info!(
            "Analysis of {} done: {} beats ({} on grid), {:.1} BPM, confidence {:.2}, {:.1}s",
            path.display(),
            beats.len(),
            quantized,
            estimate.bpm,
            estimate.confidence,
            duration_ms / 1000.0
        );

        Ok(BeatMap {
            beats,
            bpm: estimate.bpm,
            confidence: estimate.confidence,
            duration_ms,
            envelope,
            envelope_rate: 1000.0 / self.config.envelope_window_ms,
        })
    }
}

/// Snap every beat with the final tempo estimate, then restore ordering and
/// merge beats that landed on the same grid line (the stronger one wins).
fn lock_to_grid(estimator: &BpmEstimator, raw: Vec<BeatEvent>) -> Vec<BeatEvent> {
    let mut beats: Vec<BeatEvent> = raw
        .into_iter()
        .map(|beat| match estimator.snap(beat.timestamp_ms) {
            Some(grid) => BeatEvent {
                timestamp_ms: grid,
                is_quantized: true,
                ..beat
            },
            None => beat,
        })
        .collect();

    beats.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));
    beats.dedup_by(|later, kept| {
        if (later.timestamp_ms - kept.timestamp_ms).abs() < DUPLICATE_BEAT_MS {
            kept.strength = kept.strength.max(later.strength);
            kept.is_quantized |= later.is_quantized;
            true
        } else {
            false
        }
    });
    beats
}

use serde::{Deserialize, Serialize};

/// A detected (and possibly grid-snapped) beat onset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub timestamp_ms: f64,
    /// Onset strength in [0, 1]
    pub strength: f64,
    /// True once snapped to the tempo grid
    pub is_quantized: bool,
}

/// Running tempo estimate. `bpm == 0.0` means not yet determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BpmEstimate {
    pub bpm: f64,
    pub confidence: f64,
    /// Position of grid line zero, in [0, beat period)
    pub phase_offset_ms: f64,
}

impl BpmEstimate {
    pub fn is_determined(&self) -> bool {
        self.bpm > 0.0
    }

    pub fn period_ms(&self) -> Option<f64> {
        self.is_determined().then(|| 60_000.0 / self.bpm)
    }
}

/// Result of one completed full-track analysis. Never mutated after
/// construction; a new analysis produces a new map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatMap {
    /// Ascending, deduplicated
    pub beats: Vec<BeatEvent>,
    pub bpm: f64,
    pub confidence: f64,
    pub duration_ms: f64,
    /// Downsampled RMS loudness envelope
    pub envelope: Vec<f32>,
    /// Envelope points per second
    pub envelope_rate: f64,
}

impl BeatMap {
    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    /// Index of the last beat at or before `time_ms`, or `None` if `time_ms`
    /// precedes every beat.
    pub fn beat_at_or_before(&self, time_ms: f64) -> Option<usize> {
        self.beats
            .partition_point(|b| b.timestamp_ms <= time_ms)
            .checked_sub(1)
    }

    /// Index of the first beat strictly after `time_ms`.
    pub fn first_beat_after(&self, time_ms: f64) -> usize {
        self.beats.partition_point(|b| b.timestamp_ms <= time_ms)
    }

    /// Envelope value nearest to `time_ms`, 0 outside the envelope.
    pub fn loudness_at(&self, time_ms: f64) -> f32 {
        if self.envelope_rate <= 0.0 || time_ms < 0.0 {
            return 0.0;
        }
        let idx = (time_ms / 1000.0 * self.envelope_rate) as usize;
        self.envelope.get(idx).copied().unwrap_or(0.0)
    }
}

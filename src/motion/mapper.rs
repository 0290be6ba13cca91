//! Beat map + playback time + live loudness → actuator position.

use crate::analysis::BeatMap;

pub const POSITION_MIN: f64 = 5.0;
pub const POSITION_MAX: f64 = 95.0;
pub const POSITION_REST: f64 = 50.0;

/// Largest distance from rest a stroke may travel.
const STROKE_RANGE: f64 = POSITION_MAX - POSITION_REST;
/// Share of the beat interval spent on the upstroke.
const UPSTROKE_SHARE: f64 = 0.4;
/// Stroke scale at zero loudness.
const LOUDNESS_FLOOR: f64 = 0.35;
/// Weak beats still move at least this much (relative).
const STRENGTH_FLOOR: f64 = 0.3;
/// Interval used after the last beat when the tempo is unknown.
const DEFAULT_INTERVAL_MS: f64 = 500.0;
const MIN_INTERVAL_MS: f64 = 50.0;
/// Output smoothing time constant.
const SMOOTHING_TAU_MS: f64 = 40.0;

/// Stateful only in its output smoothing; the mapping itself is a pure
/// function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct BeatMapper {
    last: Option<(f64, f64)>,
}

impl BeatMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous output so the next value is used as-is. Call on
    /// seek or media change.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Smoothed position for `current_ms`, always within
    /// [`POSITION_MIN`, `POSITION_MAX`].
    pub fn position(
        &mut self,
        map: Option<&BeatMap>,
        current_ms: f64,
        live_amplitude: f32,
    ) -> f64 {
        if !current_ms.is_finite() {
            return POSITION_REST;
        }
        let map = match map {
            Some(map) if !map.is_empty() => map,
            _ => {
                self.last = Some((POSITION_REST, current_ms));
                return POSITION_REST;
            }
        };

        let target = raw_position(map, current_ms, live_amplitude);
        let value = match self.last {
            Some((previous, at)) if current_ms >= at => {
                let alpha = 1.0 - (-(current_ms - at) / SMOOTHING_TAU_MS).exp();
                previous + alpha * (target - previous)
            }
            // First value, or time went backwards.
            _ => target,
        };
        let value = value.clamp(POSITION_MIN, POSITION_MAX);
        self.last = Some((value, current_ms));
        value
    }
}

/// Unsmoothed stroke position.
pub fn raw_position(map: &BeatMap, current_ms: f64, live_amplitude: f32) -> f64 {
    let Some(idx) = map.beat_at_or_before(current_ms) else {
        return POSITION_REST;
    };
    let beat = &map.beats[idx];

    let interval = match map.beats.get(idx + 1) {
        Some(next) => next.timestamp_ms - beat.timestamp_ms,
        None if map.bpm > 0.0 => 60_000.0 / map.bpm,
        None => DEFAULT_INTERVAL_MS,
    }
    .max(MIN_INTERVAL_MS);

    let elapsed = current_ms - beat.timestamp_ms;
    if elapsed >= interval {
        return POSITION_REST;
    }
    let phase = elapsed / interval;

    let loudness = (live_amplitude.max(0.0) as f64).min(1.0);
    let scale = LOUDNESS_FLOOR + (1.0 - LOUDNESS_FLOOR) * loudness;
    let strength = beat.strength.clamp(STRENGTH_FLOOR, 1.0);
    let amplitude = STROKE_RANGE * scale * strength;

    let bottom = POSITION_REST - amplitude;
    let top = POSITION_REST + amplitude;

    let position = if phase < UPSTROKE_SHARE {
        let t = phase / UPSTROKE_SHARE;
        let eased = 1.0 - (1.0 - t) * (1.0 - t);
        bottom + (top - bottom) * eased
    } else {
        let t = (phase - UPSTROKE_SHARE) / (1.0 - UPSTROKE_SHARE);
        top - (top - bottom) * t * t
    };
    position.clamp(POSITION_MIN, POSITION_MAX)
}

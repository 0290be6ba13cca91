use std::sync::Arc;

use super::state::EngineState;
use crate::analysis::BeatMap;

/// Receiver of everything the engine publishes.
///
/// Calls are made with no engine lock held, so implementations may call back
/// into the engine. All methods default to doing nothing.
pub trait EventSink: Send + Sync {
    fn state_changed(&self, _state: EngineState) {}

    fn analysis_progress(&self, _progress: f32) {}

    fn analysis_complete(&self, _map: &Arc<BeatMap>) {}

    fn analysis_failed(&self, _message: &str) {}

    /// Live actuator position for `axis`, in [5, 95].
    fn axis_position(&self, _axis: &str, _position: f64) {}

    /// Upcoming beat timestamps (ms) within the lookahead window.
    ///
    /// Sent when the window changes and whenever output starts (entering
    /// Active, or after a seek), not on every tick. Keep the last list.
    fn beat_lookahead(&self, _source_id: &str, _beats: &[f64]) {}

    /// Announce or retract this engine as a live rhythm source.
    fn set_beat_source_registered(&self, _source_id: &str, _registered: bool) {}

    /// Ask other control sources to stand down while we drive the axis.
    fn set_competing_source_suppressed(&self, _suppressed: bool) {}
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn state_changed(&self, state: EngineState) {
        log::info!("Engine state: {:?}", state);
    }

    fn analysis_progress(&self, progress: f32) {
        log::debug!("Analysis progress: {:.0}%", progress * 100.0);
    }

    fn analysis_complete(&self, map: &Arc<BeatMap>) {
        log::info!(
            "Beat map ready: {} beats, {:.1} BPM (confidence {:.2})",
            map.beats.len(),
            map.bpm,
            map.confidence
        );
    }

    fn analysis_failed(&self, message: &str) {
        log::warn!("Analysis failed: {}", message);
    }

    fn axis_position(&self, axis: &str, position: f64) {
        log::trace!("{} -> {:.1}", axis, position);
    }

    fn beat_lookahead(&self, source_id: &str, beats: &[f64]) {
        log::debug!("{}: {} upcoming beats", source_id, beats.len());
    }

    fn set_beat_source_registered(&self, source_id: &str, registered: bool) {
        log::info!("Beat source {} registered: {}", source_id, registered);
    }

    fn set_competing_source_suppressed(&self, suppressed: bool) {
        log::info!("Competing control sources suppressed: {}", suppressed);
    }
}

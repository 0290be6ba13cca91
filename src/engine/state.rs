//! Engine state and transitions.
//!
//! Every transition runs under the engine lock and returns the list of
//! [`Effect`]s it caused. The caller publishes them after releasing the lock,
//! so observers can safely call back into the engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::analysis::BeatMap;
use crate::audio::{AmplitudeTracker, SampleConsumer};
use crate::error::{Error, Result};
use crate::motion::BeatMapper;

/// Samples drained from the live buffer per read.
const DRAIN_BLOCK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Inactive,
    Analyzing,
    Ready,
    Active,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

/// Something to publish once the lock is released.
#[derive(Debug)]
pub(crate) enum Effect {
    State(EngineState),
    Suppress(bool),
    Register(bool),
    StartAnalysis {
        generation: u64,
        path: PathBuf,
        cancel: Arc<AtomicBool>,
    },
    Progress(f32),
    Complete(Arc<BeatMap>),
    Failed(String),
    Position(f64),
    Lookahead(Vec<f64>),
}

/// Consumer side of the live loudness path.
pub(crate) struct LiveAmplitude {
    consumer: SampleConsumer,
    tracker: AmplitudeTracker,
    scratch: Vec<f32>,
    /// Written by the decode thread
    rate: Arc<AtomicU32>,
}

impl LiveAmplitude {
    pub(crate) fn new(
        consumer: SampleConsumer,
        window_ms: f64,
        rate: Arc<AtomicU32>,
    ) -> Result<Self> {
        Ok(Self {
            consumer,
            tracker: AmplitudeTracker::new(window_ms)?,
            scratch: vec![0.0; DRAIN_BLOCK],
            rate,
        })
    }

    fn restart(&mut self) {
        self.consumer.clear();
        self.tracker.reset();
    }

    /// Pull everything buffered so far into the tracker and return the
    /// latest loudness.
    fn drain(&mut self) -> f32 {
        let rate = self.rate.load(Ordering::Relaxed);
        loop {
            let n = self.consumer.read(&mut self.scratch);
            if n == 0 {
                break;
            }
            if rate > 0 {
                // Only fails on a zero rate, excluded above.
                let _ = self.tracker.update(&self.scratch[..n], rate);
            }
        }
        self.tracker.current_amplitude()
    }
}

pub(crate) struct Core {
    state: EngineState,
    enabled: bool,
    playing: bool,
    media: Option<PathBuf>,
    beat_map: Option<Arc<BeatMap>>,
    generation: u64,
    cancel: Option<Arc<AtomicBool>>,
    mapper: BeatMapper,
    live: LiveAmplitude,
    /// Mirrors `state == Active` for the lock-free ingestion path
    live_gate: Arc<AtomicBool>,
    lookahead_ms: f64,
    /// First beat after the last tick position
    lookahead_from: Option<usize>,
    published: Option<(usize, usize)>,
}

impl Core {
    pub(crate) fn new(live: LiveAmplitude, live_gate: Arc<AtomicBool>, lookahead_ms: f64) -> Self {
        Self {
            state: EngineState::Inactive,
            enabled: false,
            playing: false,
            media: None,
            beat_map: None,
            generation: 0,
            cancel: None,
            mapper: BeatMapper::new(),
            live,
            live_gate,
            lookahead_ms,
            lookahead_from: None,
            published: None,
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        self.state
    }

    pub(crate) fn beat_map(&self) -> Option<Arc<BeatMap>> {
        self.beat_map.clone()
    }

    pub(crate) fn enable(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.enabled {
            return fx;
        }
        self.enabled = true;
        fx.push(Effect::Suppress(true));
        fx.push(Effect::Register(true));
        if let Some(path) = self.media.clone() {
            self.start_analysis(path, &mut fx);
        }
        fx
    }

    pub(crate) fn disable(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.enabled {
            self.set_state(EngineState::Inactive, &mut fx);
            return fx;
        }
        self.enabled = false;
        self.cancel_analysis();
        self.drop_beat_map();
        self.live.restart();
        self.set_state(EngineState::Inactive, &mut fx);
        fx.push(Effect::Suppress(false));
        fx.push(Effect::Register(false));
        fx
    }

    pub(crate) fn media_loaded(&mut self, path: PathBuf) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.media = Some(path.clone());
        if self.enabled {
            self.start_analysis(path, &mut fx);
        }
        fx
    }

    pub(crate) fn playback_changed(&mut self, playback: PlaybackState) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.playing = playback == PlaybackState::Playing;
        match (self.state, self.playing) {
            (EngineState::Ready, true) => self.set_state(EngineState::Active, &mut fx),
            (EngineState::Active, false) => self.set_state(EngineState::Ready, &mut fx),
            _ => {}
        }
        fx
    }

    pub(crate) fn seek_completed(&mut self) -> Vec<Effect> {
        self.reset_lookahead();
        self.mapper.reset();
        if self.state == EngineState::Active {
            self.live.restart();
        }
        Vec::new()
    }

    pub(crate) fn analysis_progress(&mut self, generation: u64, progress: f32) -> Vec<Effect> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        vec![Effect::Progress(progress)]
    }

    pub(crate) fn analysis_finished(
        &mut self,
        generation: u64,
        result: Result<BeatMap>,
    ) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.is_current(generation) {
            return fx;
        }
        match result {
            Ok(map) => {
                self.cancel = None;
                let map = Arc::new(map);
                self.beat_map = Some(Arc::clone(&map));
                self.reset_lookahead();
                self.mapper.reset();
                fx.push(Effect::Complete(map));
                let next = if self.playing {
                    EngineState::Active
                } else {
                    EngineState::Ready
                };
                self.set_state(next, &mut fx);
            }
            Err(Error::Cancelled) => {}
            Err(err) => {
                self.cancel = None;
                fx.push(Effect::Failed(err.to_string()));
                self.set_state(EngineState::Error, &mut fx);
            }
        }
        fx
    }

    pub(crate) fn tick(&mut self, position_ms: f64) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state != EngineState::Active {
            return fx;
        }
        let amplitude = self.live.drain();
        let map = self.beat_map.clone();
        let position = self.mapper.position(map.as_deref(), position_ms, amplitude);
        fx.push(Effect::Position(position));

        if let Some(map) = map {
            self.publish_lookahead(&map, position_ms, &mut fx);
        }
        fx
    }

    /// Cancel anything in flight. Used when the engine goes away.
    pub(crate) fn shutdown(&mut self) {
        self.cancel_analysis();
        self.live_gate.store(false, Ordering::Release);
    }

    fn publish_lookahead(&mut self, map: &BeatMap, position_ms: f64, fx: &mut Vec<Effect>) {
        let beats = &map.beats;
        let mut from = match self.lookahead_from {
            // Still valid unless playback moved backwards past it.
            Some(i)
                if i <= beats.len() && (i == 0 || beats[i - 1].timestamp_ms <= position_ms) =>
            {
                i
            }
            _ => map.first_beat_after(position_ms),
        };
        while from < beats.len() && beats[from].timestamp_ms <= position_ms {
            from += 1;
        }
        let horizon = position_ms + self.lookahead_ms;
        let to = from + beats[from..].partition_point(|b| b.timestamp_ms <= horizon);
        self.lookahead_from = Some(from);

        if self.published != Some((from, to)) {
            self.published = Some((from, to));
            fx.push(Effect::Lookahead(
                beats[from..to].iter().map(|b| b.timestamp_ms).collect(),
            ));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.enabled && self.state == EngineState::Analyzing && generation == self.generation
    }

    fn start_analysis(&mut self, path: PathBuf, fx: &mut Vec<Effect>) {
        self.cancel_analysis();
        self.drop_beat_map();
        self.generation += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel = Some(Arc::clone(&cancel));
        self.set_state(EngineState::Analyzing, fx);
        log::info!("Starting analysis #{} of {}", self.generation, path.display());
        fx.push(Effect::StartAnalysis {
            generation: self.generation,
            path,
            cancel,
        });
    }

    fn cancel_analysis(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    fn drop_beat_map(&mut self) {
        self.beat_map = None;
        self.mapper.reset();
        self.reset_lookahead();
    }

    fn reset_lookahead(&mut self) {
        self.lookahead_from = None;
        self.published = None;
    }

    fn set_state(&mut self, next: EngineState, fx: &mut Vec<Effect>) {
        if next == self.state {
            return;
        }
        log::debug!("{:?} -> {:?}", self.state, next);
        if next == EngineState::Active {
            self.live.restart();
            // Observers get the current window again on every start.
            self.reset_lookahead();
        }
        self.state = next;
        self.live_gate
            .store(next == EngineState::Active, Ordering::Release);
        fx.push(Effect::State(next));
    }
}

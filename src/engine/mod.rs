//! Coordinates analysis and live output.
//!
//! Three call sites drive the engine concurrently: the control thread
//! (enable/disable, media and playback events), the decode thread
//! ([`Engine::push_samples`]) and a display timer ([`Engine::tick`]). All state
//! lives behind one mutex. Notifications are queued in the order the
//! transitions ran and delivered after the mutex is released, by one thread
//! at a time.

mod sink;
mod state;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::analysis::{AnalysisPipeline, BeatMap};
use crate::audio::{ring_buffer, SampleProducer};
use crate::error::{Error, Result};

pub use sink::{EventSink, LogSink};
pub use state::{EngineState, PlaybackState};

use state::{Core, Effect, LiveAmplitude};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Axis the position stream is published under
    pub axis: String,
    /// Identifier used for beat source registration and lookahead updates
    pub source_id: String,
    /// Live sample buffer capacity
    pub ring_capacity: usize,
    /// RMS window for live loudness
    pub live_window_ms: f64,
    /// How far ahead upcoming beats are published
    pub lookahead_ms: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            axis: "L0".into(),
            source_id: "beatstroke".into(),
            ring_capacity: 48_000,
            live_window_ms: 50.0,
            lookahead_ms: 5000.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.axis.is_empty() {
            return Err(Error::config("axis name must not be empty"));
        }
        if self.ring_capacity < 2 {
            return Err(Error::config("live ring buffer needs at least 2 slots"));
        }
        if !(self.lookahead_ms >= 0.0) {
            return Err(Error::config("lookahead must not be negative"));
        }
        Ok(())
    }
}

struct Inner {
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    pipeline: Arc<AnalysisPipeline>,
    core: Mutex<Core>,
    /// Signalled whenever the state changes
    state_changed: Condvar,
    /// Open while Active; checked by the decode thread without the core lock
    live_gate: Arc<AtomicBool>,
    live_rate: Arc<AtomicU32>,
    producer: Mutex<SampleProducer>,
    outbox: Mutex<Outbox>,
    /// Signalled when the outbox goes idle
    drained: Condvar,
}

/// Effects waiting to be delivered, in transition order.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<Effect>,
    /// Some thread is delivering; everyone else only enqueues
    draining: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(core) = self.core.get_mut() {
            core.shutdown();
        }
    }
}

/// Handle to the engine. Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        pipeline: AnalysisPipeline,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let (producer, consumer) = ring_buffer(config.ring_capacity)?;
        let live_gate = Arc::new(AtomicBool::new(false));
        let live_rate = Arc::new(AtomicU32::new(0));
        let live = LiveAmplitude::new(consumer, config.live_window_ms, Arc::clone(&live_rate))?;
        let core = Core::new(live, Arc::clone(&live_gate), config.lookahead_ms);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                sink,
                pipeline: Arc::new(pipeline),
                core: Mutex::new(core),
                state_changed: Condvar::new(),
                live_gate,
                live_rate,
                producer: Mutex::new(producer),
                outbox: Mutex::new(Outbox::default()),
                drained: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EngineState {
        self.core().map_or(EngineState::Error, |core| core.state())
    }

    /// The beat map of the last completed analysis for the current media.
    pub fn beat_map(&self) -> Option<Arc<BeatMap>> {
        self.core().and_then(|core| core.beat_map())
    }

    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.apply(Core::enable);
        } else {
            self.apply(Core::disable);
        }
    }

    pub fn media_loaded(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.apply(move |core| core.media_loaded(path));
    }

    pub fn playback_changed(&self, playback: PlaybackState) {
        self.apply(move |core| core.playback_changed(playback));
    }

    pub fn seek_completed(&self) {
        self.apply(Core::seek_completed);
    }

    /// Display-rate update. Publishes the axis position and any change in
    /// upcoming beats. Does nothing unless Active.
    pub fn tick(&self, position_ms: f64) {
        if !position_ms.is_finite() {
            return;
        }
        self.apply(move |core| core.tick(position_ms));
    }

    /// Decode-thread entry point. Never blocks: if the engine is not Active,
    /// or another push is in progress, the samples are dropped.
    pub fn push_samples(&self, samples: &[f32], sample_rate: u32) {
        if sample_rate == 0 || !self.inner.live_gate.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut producer) = self.inner.producer.try_lock() {
            self.inner.live_rate.store(sample_rate, Ordering::Relaxed);
            producer.write(samples);
        }
    }

    /// Block until no analysis is running and every queued notification has
    /// reached the sink, or `timeout` elapses. Returns the state at that
    /// point. Calling this from inside a sink callback waits out the timeout.
    pub fn wait_for_analysis(&self, timeout: Duration) -> EngineState {
        let deadline = Instant::now().checked_add(timeout);
        let Some(core) = self.core() else {
            return EngineState::Error;
        };
        let state = match self
            .inner
            .state_changed
            .wait_timeout_while(core, timeout, |core| core.state() == EngineState::Analyzing)
        {
            Ok((core, _)) => core.state(),
            Err(_) => return EngineState::Error,
        };

        if let Ok(outbox) = self.inner.outbox.lock() {
            let remaining =
                deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            let _ = self
                .inner
                .drained
                .wait_timeout_while(outbox, remaining, |outbox| outbox.draining);
        }
        state
    }

    fn core(&self) -> Option<MutexGuard<'_, Core>> {
        match self.inner.core.lock() {
            Ok(core) => Some(core),
            Err(_) => {
                log::warn!("Engine state lock poisoned, ignoring call");
                None
            }
        }
    }

    /// Run a transition under the lock, then publish what it produced.
    ///
    /// Effects are queued before the core lock is released, so the queue
    /// holds them in transition order. Whoever finds the outbox idle delivers
    /// until it is empty, including effects queued meanwhile by other threads
    /// or by sinks calling back into the engine.
    fn apply(&self, transition: impl FnOnce(&mut Core) -> Vec<Effect>) {
        {
            let Some(mut core) = self.core() else {
                return;
            };
            let effects = transition(&mut *core);
            if effects.is_empty() {
                return;
            }
            if effects.iter().any(|e| matches!(e, Effect::State(_))) {
                self.inner.state_changed.notify_all();
            }
            let Ok(mut outbox) = self.inner.outbox.lock() else {
                log::warn!("Engine outbox poisoned, dropping notifications");
                return;
            };
            outbox.queue.extend(effects);
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            let effect = match self.inner.outbox.lock() {
                Ok(mut outbox) => match outbox.queue.pop_front() {
                    Some(effect) => effect,
                    None => {
                        outbox.draining = false;
                        self.inner.drained.notify_all();
                        return;
                    }
                },
                Err(_) => return,
            };
            self.publish(effect);
        }
    }

    fn publish(&self, effect: Effect) {
        let sink = &self.inner.sink;
        let config = &self.inner.config;
        match effect {
            Effect::State(state) => sink.state_changed(state),
            Effect::Suppress(on) => sink.set_competing_source_suppressed(on),
            Effect::Register(on) => sink.set_beat_source_registered(&config.source_id, on),
            Effect::StartAnalysis {
                generation,
                path,
                cancel,
            } => self.spawn_analysis(generation, path, cancel),
            Effect::Progress(progress) => sink.analysis_progress(progress),
            Effect::Complete(map) => sink.analysis_complete(&map),
            Effect::Failed(message) => sink.analysis_failed(&message),
            Effect::Position(position) => sink.axis_position(&config.axis, position),
            Effect::Lookahead(beats) => sink.beat_lookahead(&config.source_id, &beats),
        }
    }

    fn spawn_analysis(&self, generation: u64, path: PathBuf, cancel: Arc<AtomicBool>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let pipeline = Arc::clone(&self.inner.pipeline);

        let spawned = thread::Builder::new()
            .name("beat-analysis".to_string())
            .spawn(move || {
                let result = pipeline.run(&path, &cancel, |progress| {
                    if let Some(inner) = weak.upgrade() {
                        Engine { inner }.apply(|core| core.analysis_progress(generation, progress));
                    }
                });
                if let Err(ref err) = result {
                    if !matches!(err, Error::Cancelled) {
                        log::warn!("Analysis of {} failed: {}", path.display(), err);
                    }
                }
                if let Some(inner) = weak.upgrade() {
                    Engine { inner }.apply(|core| core.analysis_finished(generation, result));
                }
            });

        if let Err(err) = spawned {
            log::warn!("Failed to spawn analysis thread: {}", err);
            self.apply(|core| {
                core.analysis_finished(
                    generation,
                    Err(Error::AnalysisFailure(format!(
                        "failed to spawn analysis thread: {}",
                        err
                    ))),
                )
            });
        }
    }
}

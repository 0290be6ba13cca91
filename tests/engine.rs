use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use beatstroke::analysis::{AnalysisPipeline, BeatMap, PipelineConfig};
use beatstroke::audio::{AudioChunk, ChunkStream, MediaDecoder};
use beatstroke::engine::{Engine, EngineConfig, EngineState, EventSink, PlaybackState};
use beatstroke::Error;

const SR: u32 = 16_384;
const TIMEOUT: Duration = Duration::from_secs(30);

/// Click track decoder that holds back its first chunk until released.
struct GatedDecoder {
    release: Arc<AtomicBool>,
    fail: bool,
}

impl GatedDecoder {
    fn open() -> Self {
        Self {
            release: Arc::new(AtomicBool::new(true)),
            fail: false,
        }
    }

    fn held() -> (Self, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        (
            Self {
                release: Arc::clone(&release),
                fail: false,
            },
            release,
        )
    }
}

impl MediaDecoder for GatedDecoder {
    fn decode(&self, _path: &Path, cancel: Arc<AtomicBool>) -> beatstroke::Result<ChunkStream> {
        let release = Arc::clone(&self.release);
        let fail = self.fail;
        let seconds = 8.0;
        let len = (seconds * SR as f64) as usize;
        let period = SR as usize / 2;
        let mut samples = vec![0.0f32; len];
        for start in (0..len).step_by(period) {
            for i in 0..(SR as usize / 200) {
                let t = i as f32 / SR as f32;
                samples[start + i] = 0.9 * (2.0 * std::f32::consts::PI * 1000.0 * t).sin();
            }
        }
        let chunk_len = SR as usize / 10;
        let chunks: Vec<AudioChunk> = samples
            .chunks(chunk_len)
            .enumerate()
            .map(|(i, part)| AudioChunk {
                samples: part.to_vec(),
                sample_rate: SR,
                start_ms: (i * chunk_len) as f64 * 1000.0 / SR as f64,
                total_duration_ms: seconds * 1000.0,
            })
            .collect();

        let mut waited = false;
        Ok(Box::new(chunks.into_iter().map(move |chunk| {
            if !waited {
                waited = true;
                while !release.load(Ordering::Acquire) {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            if fail {
                return Err(Error::AnalysisFailure("unsupported codec".into()));
            }
            Ok(chunk)
        })))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    State(EngineState),
    Complete(usize),
    Failed(String),
    Position(String, f64),
    Lookahead(Vec<f64>),
    Registered(bool),
    Suppressed(bool),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
    /// When set, every notification calls back into the engine.
    reenter: OnceLock<Engine>,
}

impl RecordingSink {
    fn push(&self, event: Event) {
        if let Some(engine) = self.reenter.get() {
            // Would deadlock if notifications were sent under the engine lock.
            let _ = engine.state();
        }
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn states(&self) -> Vec<EngineState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn state_changed(&self, state: EngineState) {
        self.push(Event::State(state));
    }

    fn analysis_complete(&self, map: &Arc<BeatMap>) {
        self.push(Event::Complete(map.beats.len()));
    }

    fn analysis_failed(&self, message: &str) {
        self.push(Event::Failed(message.to_string()));
    }

    fn axis_position(&self, axis: &str, position: f64) {
        self.push(Event::Position(axis.to_string(), position));
    }

    fn beat_lookahead(&self, _source_id: &str, beats: &[f64]) {
        self.push(Event::Lookahead(beats.to_vec()));
    }

    fn set_beat_source_registered(&self, _source_id: &str, registered: bool) {
        self.push(Event::Registered(registered));
    }

    fn set_competing_source_suppressed(&self, suppressed: bool) {
        self.push(Event::Suppressed(suppressed));
    }
}

/// Records like [`RecordingSink`] but parks the analysis thread inside
/// `analysis_complete` until released.
#[derive(Default)]
struct ParkingSink {
    recorder: RecordingSink,
    parked: AtomicBool,
    release: AtomicBool,
}

impl EventSink for ParkingSink {
    fn state_changed(&self, state: EngineState) {
        self.recorder.state_changed(state);
    }

    fn analysis_complete(&self, map: &Arc<BeatMap>) {
        self.parked.store(true, Ordering::Release);
        while !self.release.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.recorder.analysis_complete(map);
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn engine_with(decoder: GatedDecoder) -> (Engine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let pipeline = AnalysisPipeline::new(PipelineConfig::default(), Arc::new(decoder)).unwrap();
    let config = EngineConfig {
        axis: "L0".into(),
        ..Default::default()
    };
    let engine = Engine::new(config, pipeline, sink.clone()).unwrap();
    (engine, sink)
}

#[test]
fn enable_analyze_play_and_tick() {
    let (decoder, release) = GatedDecoder::held();
    let (engine, sink) = engine_with(decoder);

    engine.media_loaded("track.flac");
    assert_eq!(engine.state(), EngineState::Inactive);

    engine.set_enabled(true);
    assert_eq!(engine.state(), EngineState::Analyzing);

    release.store(true, Ordering::Release);
    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Ready);
    let map = engine.beat_map().expect("beat map after analysis");
    assert!(!map.beats.is_empty());

    engine.playback_changed(PlaybackState::Playing);
    assert_eq!(engine.state(), EngineState::Active);

    engine.push_samples(&vec![0.5; 4096], SR);
    engine.tick(0.0);

    let events = sink.events();
    let position = events.iter().find_map(|e| match e {
        Event::Position(axis, p) => Some((axis.clone(), *p)),
        _ => None,
    });
    let (axis, position) = position.expect("no axis position published");
    assert_eq!(axis, "L0");
    assert!((5.0..=95.0).contains(&position));

    assert_eq!(
        sink.states(),
        vec![EngineState::Analyzing, EngineState::Ready, EngineState::Active]
    );
    let suppress = events
        .iter()
        .position(|e| *e == Event::Suppressed(true))
        .unwrap();
    let register = events
        .iter()
        .position(|e| *e == Event::Registered(true))
        .unwrap();
    assert!(suppress < register);
    assert!(events.iter().any(|e| matches!(e, Event::Complete(n) if *n > 0)));
}

#[test]
fn playing_during_analysis_goes_straight_to_active() {
    let (decoder, release) = GatedDecoder::held();
    let (engine, sink) = engine_with(decoder);

    engine.media_loaded("track.flac");
    engine.set_enabled(true);
    engine.playback_changed(PlaybackState::Playing);
    assert_eq!(engine.state(), EngineState::Analyzing);

    release.store(true, Ordering::Release);
    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Active);
    assert_eq!(sink.states(), vec![EngineState::Analyzing, EngineState::Active]);
}

#[test]
fn ticks_publish_lookahead_beats() {
    let (engine, sink) = engine_with(GatedDecoder::open());
    engine.media_loaded("track.flac");
    engine.set_enabled(true);
    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Ready);
    engine.playback_changed(PlaybackState::Playing);

    engine.tick(100.0);
    let lookahead = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            Event::Lookahead(beats) => Some(beats),
            _ => None,
        })
        .expect("no lookahead published");
    assert!(!lookahead.is_empty());
    assert!(lookahead.iter().all(|&t| t > 100.0 && t <= 5100.0));
    assert!(lookahead.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn decoder_failure_moves_to_error() {
    let decoder = GatedDecoder {
        fail: true,
        ..GatedDecoder::open()
    };
    let (engine, sink) = engine_with(decoder);
    engine.media_loaded("broken.ogg");
    engine.set_enabled(true);

    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Error);
    assert!(engine.beat_map().is_none());
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, Event::Failed(msg) if msg.contains("unsupported codec"))));

    // Position ticks and samples are ignored outside Active.
    engine.tick(0.0);
    engine.push_samples(&[0.1; 128], SR);
    assert!(!sink.events().iter().any(|e| matches!(e, Event::Position(..))));
}

#[test]
fn disable_during_analysis_cancels_quietly() {
    let (decoder, release) = GatedDecoder::held();
    let (engine, sink) = engine_with(decoder);
    engine.media_loaded("track.flac");
    engine.set_enabled(true);
    engine.set_enabled(false);
    release.store(true, Ordering::Release);

    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Inactive);
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(engine.state(), EngineState::Inactive);
    assert!(engine.beat_map().is_none());
    let events = sink.events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Complete(_) | Event::Failed(_))));
    assert_eq!(sink.states(), vec![EngineState::Analyzing, EngineState::Inactive]);

    let unsuppress = events
        .iter()
        .position(|e| *e == Event::Suppressed(false))
        .unwrap();
    let unregister = events
        .iter()
        .position(|e| *e == Event::Registered(false))
        .unwrap();
    assert!(unsuppress < unregister);

    // Idempotent.
    engine.set_enabled(false);
    assert_eq!(sink.events().len(), events.len());
}

#[test]
fn new_media_supersedes_running_analysis() {
    let (decoder, release) = GatedDecoder::held();
    let (engine, sink) = engine_with(decoder);
    engine.media_loaded("first.flac");
    engine.set_enabled(true);
    engine.media_loaded("second.flac");
    release.store(true, Ordering::Release);

    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Ready);
    std::thread::sleep(Duration::from_millis(100));
    let completions = sink
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Complete(_)))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(sink.states(), vec![EngineState::Analyzing, EngineState::Ready]);
}

#[test]
fn observers_may_call_back_into_the_engine() {
    let (engine, sink) = engine_with(GatedDecoder::open());
    let _ = sink.reenter.set(engine.clone());

    engine.media_loaded("track.flac");
    engine.set_enabled(true);
    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Ready);
    engine.playback_changed(PlaybackState::Playing);
    engine.tick(250.0);
    engine.seek_completed();
    engine.tick(3000.0);
    engine.set_enabled(false);

    assert_eq!(engine.state(), EngineState::Inactive);
    assert!(sink.events().iter().any(|e| matches!(e, Event::Position(..))));
}

#[test]
fn notifications_keep_transition_order_across_threads() {
    let sink = Arc::new(ParkingSink::default());
    let pipeline =
        AnalysisPipeline::new(PipelineConfig::default(), Arc::new(GatedDecoder::open())).unwrap();
    let engine = Engine::new(EngineConfig::default(), pipeline, sink.clone()).unwrap();

    engine.media_loaded("track.flac");
    engine.set_enabled(true);
    wait_until("analysis completion", || sink.parked.load(Ordering::Acquire));

    // Analysis thread is still delivering Ready when playback starts here.
    assert_eq!(engine.state(), EngineState::Ready);
    engine.playback_changed(PlaybackState::Playing);
    assert_eq!(engine.state(), EngineState::Active);

    sink.release.store(true, Ordering::Release);
    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Active);
    assert_eq!(
        sink.recorder.states(),
        vec![EngineState::Analyzing, EngineState::Ready, EngineState::Active]
    );
    assert_eq!(sink.recorder.states().last(), Some(&engine.state()));
}

#[test]
fn positions_never_follow_the_disable_notifications() {
    let (engine, sink) = engine_with(GatedDecoder::open());
    engine.media_loaded("track.flac");
    engine.set_enabled(true);
    assert_eq!(engine.wait_for_analysis(TIMEOUT), EngineState::Ready);
    engine.playback_changed(PlaybackState::Playing);

    let ticker = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for i in 0..2000 {
                engine.tick(i as f64);
            }
        })
    };
    std::thread::sleep(Duration::from_millis(2));
    engine.set_enabled(false);
    ticker.join().unwrap();
    engine.wait_for_analysis(TIMEOUT);

    let events = sink.events();
    let unregister = events
        .iter()
        .position(|e| *e == Event::Registered(false))
        .unwrap();
    assert!(!events[unregister..]
        .iter()
        .any(|e| matches!(e, Event::Position(..) | Event::Lookahead(_))));
}

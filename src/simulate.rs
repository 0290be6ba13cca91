use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beatstroke::analysis::{AnalysisPipeline, BeatMap};
use beatstroke::audio::{MediaDecoder, SymphoniaDecoder};
use beatstroke::config::Config;
use beatstroke::engine::{Engine, EngineState, EventSink, LogSink, PlaybackState};

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Default)]
struct Stats {
    positions: usize,
    min: f64,
    max: f64,
    sum: f64,
    lookahead_updates: usize,
}

/// Logs like [`LogSink`], shows analysis progress and collects position
/// statistics.
struct SimulationSink {
    log: LogSink,
    progress: ProgressBar,
    stats: Mutex<Stats>,
}

impl SimulationSink {
    fn new() -> Result<Self> {
        let progress = ProgressBar::new(1000);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} analyzing {percent}%")?
                .progress_chars("=>-"),
        );
        Ok(Self {
            log: LogSink,
            progress,
            stats: Mutex::new(Stats {
                min: f64::MAX,
                max: f64::MIN,
                ..Default::default()
            }),
        })
    }
}

impl EventSink for SimulationSink {
    fn state_changed(&self, state: EngineState) {
        self.log.state_changed(state);
    }

    fn analysis_progress(&self, progress: f32) {
        self.progress.set_position((progress * 1000.0) as u64);
    }

    fn analysis_complete(&self, map: &Arc<BeatMap>) {
        self.progress.finish_and_clear();
        self.log.analysis_complete(map);
    }

    fn analysis_failed(&self, message: &str) {
        self.progress.abandon();
        self.log.analysis_failed(message);
    }

    fn axis_position(&self, axis: &str, position: f64) {
        self.log.axis_position(axis, position);
        if let Ok(mut stats) = self.stats.lock() {
            stats.positions += 1;
            stats.min = stats.min.min(position);
            stats.max = stats.max.max(position);
            stats.sum += position;
        }
    }

    fn beat_lookahead(&self, source_id: &str, beats: &[f64]) {
        self.log.beat_lookahead(source_id, beats);
        if let Ok(mut stats) = self.stats.lock() {
            stats.lookahead_updates += 1;
        }
    }

    fn set_beat_source_registered(&self, source_id: &str, registered: bool) {
        self.log.set_beat_source_registered(source_id, registered);
    }

    fn set_competing_source_suppressed(&self, suppressed: bool) {
        self.log.set_competing_source_suppressed(suppressed);
    }
}

/// Analyze `file` through the engine, then replay it: decoded chunks go to
/// the live path and the timeline is ticked at `rate` Hz.
pub fn run(cfg: &Config, file: &Path, rate: u32, realtime: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("Input file not found: {}", file.display());
    }

    let sink = Arc::new(SimulationSink::new()?);
    let pipeline = AnalysisPipeline::new(cfg.pipeline_config(), Arc::new(SymphoniaDecoder))
        .context("Invalid analysis settings")?;
    let engine = Engine::new(cfg.engine_config(), pipeline, sink.clone())
        .context("Invalid engine settings")?;

    engine.set_enabled(true);
    engine.media_loaded(file);
    let state = engine.wait_for_analysis(ANALYSIS_TIMEOUT);
    if state != EngineState::Ready {
        engine.set_enabled(false);
        anyhow::bail!("Analysis did not complete (engine is {:?})", state);
    }

    engine.playback_changed(PlaybackState::Playing);

    let tick_ms = 1000.0 / rate.max(1) as f64;
    let mut next_tick = 0.0;
    let started = Instant::now();
    let chunks = SymphoniaDecoder
        .decode(file, Arc::new(AtomicBool::new(false)))
        .context("Failed to reopen audio for playback")?;

    for chunk in chunks {
        let chunk = chunk.context("Decoding failed during playback")?;
        engine.push_samples(&chunk.samples, chunk.sample_rate);

        let chunk_end =
            chunk.start_ms + chunk.samples.len() as f64 * 1000.0 / chunk.sample_rate as f64;
        while next_tick < chunk_end {
            if realtime {
                let due = Duration::from_secs_f64(next_tick / 1000.0);
                if let Some(wait) = due.checked_sub(started.elapsed()) {
                    std::thread::sleep(wait);
                }
            }
            engine.tick(next_tick);
            next_tick += tick_ms;
        }
    }

    engine.playback_changed(PlaybackState::Stopped);
    engine.set_enabled(false);

    let stats = sink
        .stats
        .lock()
        .map_err(|_| anyhow::anyhow!("statistics lock poisoned"))?;
    if stats.positions == 0 {
        println!("No positions were generated");
    } else {
        println!(
            "{} positions over {:.1}s: min {:.1}, max {:.1}, mean {:.1}, {} lookahead updates",
            stats.positions,
            next_tick / 1000.0,
            stats.min,
            stats.max,
            stats.sum / stats.positions as f64,
            stats.lookahead_updates
        );
    }
    Ok(())
}

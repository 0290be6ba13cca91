mod cli;
mod simulate;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use beatstroke::analysis::{AnalysisPipeline, BeatMap};
use beatstroke::audio::SymphoniaDecoder;
use beatstroke::config::{self, Config};
use cli::{Cli, Command};

#[derive(Serialize)]
struct Report<'a> {
    file: &'a Path,
    #[serde(flatten)]
    beat_map: &'a BeatMap,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let mut cfg = Config::default();
    if let Some(path) = config::find_config(cli.config.clone()) {
        if let Some(loaded) = config::load_config(&path) {
            log::info!("Loaded config from {}", path.display());
            cfg = loaded;
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }
    if let Some(sensitivity) = cli.sensitivity {
        cfg.onset.sensitivity = sensitivity;
    }

    match cli.command {
        Command::Analyze { files, json } => analyze(&cfg, &files, json),
        Command::Simulate {
            file,
            rate,
            realtime,
        } => simulate::run(&cfg, &file, rate, realtime),
    }
}

fn analyze(cfg: &Config, files: &[PathBuf], json: bool) -> Result<()> {
    for file in files {
        if !file.exists() {
            anyhow::bail!("Input file not found: {}", file.display());
        }
    }

    let pipeline = AnalysisPipeline::new(cfg.pipeline_config(), Arc::new(SymphoniaDecoder))
        .context("Invalid analysis settings")?;
    let cancel = Arc::new(AtomicBool::new(false));

    let maps: Vec<(&Path, BeatMap)> = if let [file] = files {
        let pb = ProgressBar::new(1000);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% ({eta} remaining)")?
                .progress_chars("=>-"),
        );
        let map = pipeline
            .run(file, &cancel, |progress| pb.set_position((progress * 1000.0) as u64))
            .with_context(|| format!("Failed to analyze {}", file.display()))?;
        pb.finish_and_clear();
        vec![(file.as_path(), map)]
    } else {
        log::info!("Analyzing {} files in parallel", files.len());
        files
            .par_iter()
            .map(|file| {
                pipeline
                    .run(file, &cancel, |_| {})
                    .map(|map| (file.as_path(), map))
                    .with_context(|| format!("Failed to analyze {}", file.display()))
            })
            .collect::<Result<_>>()?
    };

    if json {
        let reports: Vec<Report> = maps
            .iter()
            .map(|(file, beat_map)| Report {
                file: *file,
                beat_map,
            })
            .collect();
        let out = if let [report] = reports.as_slice() {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string_pretty(&reports)?
        };
        println!("{}", out);
    } else {
        for (file, map) in &maps {
            let on_grid = map.beats.iter().filter(|b| b.is_quantized).count();
            println!(
                "{}: {} beats ({} on grid), {:.1} BPM, confidence {:.2}, {:.1}s",
                file.display(),
                map.beats.len(),
                on_grid,
                map.bpm,
                map.confidence,
                map.duration_ms / 1000.0
            );
        }
    }
    Ok(())
}

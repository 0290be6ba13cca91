use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::amplitude::downmix_into;
use crate::error::{Error, Result};

/// Length of the chunks handed to the analysis pipeline.
pub const CHUNK_MS: f64 = 100.0;

/// A run of mono PCM with its position on the media timeline.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub start_ms: f64,
    /// Total media duration, 0 if unknown.
    pub total_duration_ms: f64,
}

pub type ChunkStream = Box<dyn Iterator<Item = Result<AudioChunk>> + Send>;

/// Source of decoded audio for a media path.
///
/// Every call starts a fresh pass over the media. Implementations should
/// check `cancel` between chunks and yield [`Error::Cancelled`] once it is set.
pub trait MediaDecoder: Send + Sync {
    fn decode(&self, path: &Path, cancel: Arc<AtomicBool>) -> Result<ChunkStream>;
}

/// [`MediaDecoder`] backed by symphonia.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl MediaDecoder for SymphoniaDecoder {
    fn decode(&self, path: &Path, cancel: Arc<AtomicBool>) -> Result<ChunkStream> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::AnalysisFailure(format!("failed to open {}: {}", path.display(), e))
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::AnalysisFailure(format!("failed to probe audio format: {}", e)))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::AnalysisFailure("no audio tracks found".into()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::AnalysisFailure("unknown sample rate".into()))?;
        let total_duration_ms = track
            .codec_params
            .n_frames
            .map_or(0.0, |frames| frames as f64 * 1000.0 / sample_rate as f64);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::AnalysisFailure(format!("failed to create decoder: {}", e)))?;

        log::debug!(
            "Opened {}: {}Hz, {:.1}s",
            path.display(),
            sample_rate,
            total_duration_ms / 1000.0
        );

        Ok(Box::new(SymphoniaChunks {
            format,
            decoder,
            track_id,
            sample_rate,
            total_duration_ms,
            chunk_len: ((sample_rate as f64 * CHUNK_MS / 1000.0) as usize).max(1),
            pending: Vec::new(),
            mono: Vec::new(),
            emitted: 0,
            cancel,
            finished: false,
        }))
    }
}

struct SymphoniaChunks {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    total_duration_ms: f64,
    chunk_len: usize,
    pending: Vec<f32>,
    mono: Vec<f32>,
    emitted: u64,
    cancel: Arc<AtomicBool>,
    finished: bool,
}

impl SymphoniaChunks {
    fn take_chunk(&mut self, len: usize) -> AudioChunk {
        let samples: Vec<f32> = self.pending.drain(..len).collect();
        let start_ms = self.emitted as f64 * 1000.0 / self.sample_rate as f64;
        self.emitted += samples.len() as u64;
        AudioChunk {
            samples,
            sample_rate: self.sample_rate,
            start_ms,
            total_duration_ms: self.total_duration_ms,
        }
    }

    /// Decode the next packet of our track into `pending`. Returns false at
    /// end of stream.
    fn fill(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    log::debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            downmix_into(sample_buf.samples(), channels, &mut self.mono)?;
            self.pending.extend_from_slice(&self.mono);
            return Ok(true);
        }
    }
}

impl Iterator for SymphoniaChunks {
    type Item = Result<AudioChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Some(Err(Error::Cancelled));
            }
            if self.pending.len() >= self.chunk_len {
                return Some(Ok(self.take_chunk(self.chunk_len)));
            }
            if self.finished {
                if self.pending.is_empty() {
                    return None;
                }
                let len = self.pending.len();
                return Some(Ok(self.take_chunk(len)));
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => self.finished = true,
                Err(e) => {
                    self.finished = true;
                    self.pending.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

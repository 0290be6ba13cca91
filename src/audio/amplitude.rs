//! Windowed RMS loudness and channel downmixing.

use crate::error::{Error, Result};

/// Tracks RMS loudness over fixed-length windows.
///
/// Used for the full-track loudness envelope during analysis and for live
/// intensity scaling during playback.
#[derive(Debug, Clone)]
pub struct AmplitudeTracker {
    window_ms: f64,
    sample_rate: u32,
    window_size: usize,
    sum_squares: f64,
    count: usize,
    window_start_ms: Option<f64>,
    current: f32,
}

impl AmplitudeTracker {
    pub fn new(window_ms: f64) -> Result<Self> {
        if !(window_ms > 0.0) || !window_ms.is_finite() {
            return Err(Error::config(format!(
                "amplitude window must be positive, got {} ms",
                window_ms
            )));
        }
        Ok(Self {
            window_ms,
            sample_rate: 0,
            window_size: 0,
            sum_squares: 0.0,
            count: 0,
            window_start_ms: None,
            current: 0.0,
        })
    }

    /// Most recently completed window's RMS, in [0, 1].
    pub fn current_amplitude(&self) -> f32 {
        self.current
    }

    pub fn window_ms(&self) -> f64 {
        self.window_ms
    }

    /// Feed samples and collect `(timestamp_ms, rms)` for every window that
    /// completes. Timestamps mark the start of each window.
    pub fn process(
        &mut self,
        samples: &[f32],
        start_time_ms: f64,
        sample_rate: u32,
    ) -> Result<Vec<(f64, f32)>> {
        self.prepare(sample_rate)?;
        let mut out = Vec::with_capacity(samples.len() / self.window_size + 1);
        let ms_per_sample = 1000.0 / sample_rate as f64;

        for (i, &sample) in samples.iter().enumerate() {
            if self.count == 0 {
                self.window_start_ms = Some(start_time_ms + i as f64 * ms_per_sample);
            }
            if let Some(rms) = self.accumulate(sample) {
                out.push((self.window_start_ms.unwrap_or(start_time_ms), rms));
            }
        }
        Ok(out)
    }

    /// Same accumulation as [`process`](Self::process) but only updates
    /// [`current_amplitude`](Self::current_amplitude). Does not allocate.
    pub fn update(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        self.prepare(sample_rate)?;
        for &sample in samples {
            self.accumulate(sample);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.sum_squares = 0.0;
        self.count = 0;
        self.window_start_ms = None;
        self.current = 0.0;
    }

    fn prepare(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(Error::config("sample rate must be positive"));
        }
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.window_size = ((sample_rate as f64 * self.window_ms / 1000.0) as usize).max(1);
            self.sum_squares = 0.0;
            self.count = 0;
            self.window_start_ms = None;
        }
        Ok(())
    }

    #[inline]
    fn accumulate(&mut self, sample: f32) -> Option<f32> {
        let s = sample as f64;
        self.sum_squares += s * s;
        self.count += 1;
        if self.count < self.window_size {
            return None;
        }
        let rms = ((self.sum_squares / self.count as f64).sqrt() as f32).min(1.0);
        self.current = rms;
        self.sum_squares = 0.0;
        self.count = 0;
        Some(rms)
    }
}

/// Average interleaved multi-channel audio down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(interleaved.len() / channels.max(1));
    downmix_into(interleaved, channels, &mut out)?;
    Ok(out)
}

/// Like [`downmix`] but reuses `out`, which is cleared first.
pub fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) -> Result<()> {
    if channels == 0 {
        return Err(Error::config("channel count must be positive"));
    }
    out.clear();
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return Ok(());
    }
    let scale = 1.0 / channels as f32;
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin()
            })
            .collect()
    }

    #[test]
    fn rejects_bad_window() {
        assert!(AmplitudeTracker::new(0.0).is_err());
        assert!(AmplitudeTracker::new(-5.0).is_err());
        assert!(AmplitudeTracker::new(f64::NAN).is_err());
    }

    #[test]
    fn full_scale_sine_rms() {
        let mut tracker = AmplitudeTracker::new(100.0).unwrap();
        let samples = sine(440.0, 1.0, 44_100, 44_100);
        let windows = tracker.process(&samples, 0.0, 44_100).unwrap();
        assert_eq!(windows.len(), 10);
        for (_, rms) in &windows {
            assert!((rms - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.05, "rms {}", rms);
        }
    }

    #[test]
    fn silence_is_exactly_zero() {
        let mut tracker = AmplitudeTracker::new(50.0).unwrap();
        let windows = tracker.process(&vec![0.0; 48_000], 0.0, 48_000).unwrap();
        assert!(!windows.is_empty());
        assert!(windows.iter().all(|&(_, rms)| rms == 0.0));
        assert_eq!(tracker.current_amplitude(), 0.0);
    }

    #[test]
    fn clipping_input_is_capped() {
        let mut tracker = AmplitudeTracker::new(10.0).unwrap();
        let windows = tracker.process(&vec![3.5; 4_410], 0.0, 44_100).unwrap();
        assert!(windows.iter().all(|&(_, rms)| (0.0..=1.0).contains(&rms)));
        assert_eq!(tracker.current_amplitude(), 1.0);
    }

    #[test]
    fn windows_span_calls_and_carry_timestamps() {
        let mut tracker = AmplitudeTracker::new(10.0).unwrap();
        // 10 ms at 1 kHz = 10 samples per window.
        let first = tracker.process(&[0.5; 6], 1000.0, 1000).unwrap();
        assert!(first.is_empty());
        let second = tracker.process(&[0.5; 14], 1006.0, 1000).unwrap();
        assert_eq!(second.len(), 2);
        assert!((second[0].0 - 1000.0).abs() < 1e-9);
        assert!((second[1].0 - 1010.0).abs() < 1e-9);
    }

    #[test]
    fn sample_rate_change_resets_accumulator() {
        let mut tracker = AmplitudeTracker::new(10.0).unwrap();
        tracker.update(&[1.0; 9], 1000).unwrap();
        // Switching rate discards the 9 loud samples.
        tracker.update(&[0.0; 20], 2000).unwrap();
        assert_eq!(tracker.current_amplitude(), 0.0);
    }

    #[test]
    fn update_matches_process() {
        let samples = sine(100.0, 0.3, 8_000, 8_000);
        let mut a = AmplitudeTracker::new(25.0).unwrap();
        let mut b = a.clone();
        let windows = a.process(&samples, 0.0, 8_000).unwrap();
        b.update(&samples, 8_000).unwrap();
        assert_eq!(windows.last().unwrap().1, b.current_amplitude());
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2).unwrap(), vec![0.5, 0.5, 0.0]);

        let mut reuse = vec![9.0; 10];
        downmix_into(&stereo, 2, &mut reuse).unwrap();
        assert_eq!(reuse, vec![0.5, 0.5, 0.0]);

        assert!(downmix(&stereo, 0).is_err());
    }
}

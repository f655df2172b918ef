//! WAV file input and segment recordings (hound).

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::debug;

use super::resample::downmix;
use super::AudioSource;
use crate::buffering::segment::SpeechSegment;
use crate::error::{ParleyError, Result};

/// Replays a WAV file in real time, then behaves like a quiet microphone
/// (silent blocks forever).
pub struct WavFileSource {
    samples: Vec<f32>,
    position: usize,
    sample_rate: u32,
    block: usize,
    realtime: bool,
    next_due: Option<Instant>,
}

impl WavFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = WavReader::open(path)
            .map_err(|e| ParleyError::Device(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(anyhow::Error::from)?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(anyhow::Error::from)?
            }
        };
        let samples = downmix(&interleaved, spec.channels);
        debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            samples = samples.len(),
            "wav source opened"
        );
        Ok(Self::from_samples(samples, spec.sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            position: 0,
            sample_rate,
            // 20 ms blocks.
            block: (sample_rate as usize / 50).max(1),
            realtime: true,
            next_due: None,
        }
    }

    /// Deliver blocks as fast as they are read instead of in real time.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn finished(&self) -> bool {
        self.position >= self.samples.len()
    }

    fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block as f64 / self.sample_rate.max(1) as f64)
    }
}

impl AudioSource for WavFileSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>> {
        if self.realtime {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(None);
                }
                thread::sleep(wait);
            }
            self.next_due = Some(due + self.block_duration());
        }

        let end = (self.position + self.block).min(self.samples.len());
        let mut out = self.samples[self.position.min(end)..end].to_vec();
        self.position = end;
        out.resize(self.block, 0.0);
        Ok(Some(out))
    }
}

/// Write mono float samples as a 32-bit float WAV.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).map_err(anyhow::Error::from)?;
    for &s in samples {
        writer.write_sample(s).map_err(anyhow::Error::from)?;
    }
    writer.finalize().map_err(anyhow::Error::from)?;
    Ok(())
}

/// Saves every detected segment to `segment-<id>.wav` for offline review.
#[derive(Debug, Clone)]
pub struct SegmentRecorder {
    dir: PathBuf,
}

impl SegmentRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn record(&self, segment: &SpeechSegment) -> Result<PathBuf> {
        let path = self.dir.join(format!("segment-{:06}.wav", segment.id));
        let mono = downmix(&segment.samples(), segment.channels);
        write_wav(&path, &mono, segment.sample_rate)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_round_trip_through_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..800).map(|i| (i as f32 / 800.0) - 0.5).collect();
        write_wav(&path, &samples, 16_000).unwrap();

        let mut source = WavFileSource::open(&path).unwrap().unpaced();
        assert_eq!(source.sample_rate(), 16_000);

        let mut read = Vec::new();
        while !source.finished() {
            read.extend(source.read_frame(Duration::from_millis(10)).unwrap().unwrap());
        }
        // 800 samples in 320-sample blocks: the last block is padded.
        assert_eq!(read.len(), 960);
        approx::assert_abs_diff_eq!(read[799], samples[799], epsilon = 1e-6);
        assert_eq!(read[800], 0.0);

        // Past the end the source keeps producing silence.
        let tail = source.read_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert!(tail.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn paced_source_does_not_run_ahead() {
        let mut source = WavFileSource::from_samples(vec![0.1; 16_000], 16_000);
        let started = Instant::now();
        for _ in 0..5 {
            source.read_frame(Duration::from_millis(100)).unwrap();
        }
        // Five 20 ms blocks: the first is immediate.
        assert!(started.elapsed() >= Duration::from_millis(75));
    }

    #[test]
    fn missing_file_is_a_device_error() {
        let err = WavFileSource::open(Path::new("/nonexistent/input.wav"));
        assert!(matches!(err, Err(ParleyError::Device(_))));
    }
}

//! Rate conversion between device rates and the pipeline rate, using a
//! rubato `FastFixedIn` resampler.
//!
//! Capture devices commonly run at 44.1 or 48 kHz while the pipeline works
//! at `sampleRate` (16 kHz by default). Playback needs the reverse trip for
//! synthesized audio. Conversion always happens on a regular thread, never
//! inside a device callback.
//!
//! When both rates match no rubato session is created and samples pass
//! straight through.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{ParleyError, Result};

/// Input block size handed to rubato per call.
pub const DEFAULT_CHUNK: usize = 960;

/// Converts mono f32 audio between two fixed rates.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over between calls until a full chunk is available.
    pending: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(ParleyError::Config(format!(
                "invalid sample rates {from_rate} -> {to_rate}"
            )));
        }
        let chunk_size = chunk_size.max(1);
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| ParleyError::Device(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(from_rate, to_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            from_rate,
            to_rate,
        })
    }

    /// Convert `samples`, returning whatever output full chunks produced.
    /// A partial chunk is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let input = &self.pending[..self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.output_buf, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.chunk_size);
        }
        out
    }

    /// Convert a complete clip: the tail is zero-padded to a full chunk so
    /// no input is left behind, and the output is trimmed to the expected
    /// length.
    pub fn process_all(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        let expected =
            (samples.len() as u64 * self.to_rate as u64 / self.from_rate as u64) as usize;
        let mut out = self.process(samples);
        if !self.pending.is_empty() {
            let pad = self.chunk_size - self.pending.len();
            out.extend(self.process(&vec![0.0; pad]));
        }
        out.truncate(expected);
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Drop any carried-over input (used after a flush).
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Average interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

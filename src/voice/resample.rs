//! Sample-rate conversion between audio devices and the wire format
//!
//! Devices usually run at 44.1 or 48 kHz while frames on the wire are fixed
//! at the configured rate. The resampler is fed arbitrary block sizes from
//! the audio callbacks and buffers until a full chunk is available.

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input frames per resampler chunk
const CHUNK_SIZE: usize = 1024;

/// FFT sub-chunks per chunk
const SUB_CHUNKS: usize = 2;

/// Streaming mono resampler
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler converting `from_rate` to `to_rate`
    ///
    /// Equal rates pass samples through untouched.
    ///
    /// # Errors
    ///
    /// Returns `Error::AudioInit` if the rates are unusable
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                CHUNK_SIZE,
                SUB_CHUNKS,
                1,
            )
            .map_err(|e| {
                Error::AudioInit(format!("resampler init failed ({from_rate} -> {to_rate} Hz): {e}"))
            })?;
            Some(resampler)
        };

        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Whether samples pass through unchanged
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Input frames consumed by the next chunk, `None` when passing through
    #[must_use]
    pub fn input_frames_next(&self) -> Option<usize> {
        self.inner.as_ref().map(Resampler::input_frames_next)
    }

    /// Convert a block, returning every output sample that is ready
    ///
    /// Input that does not fill a chunk is kept for the next call.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return input.to_vec();
        };

        self.pending.extend_from_slice(input);
        let mut output = Vec::new();

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            match resampler.process(&[&self.pending[..needed]], None) {
                Ok(mut chunk) => output.append(&mut chunk[0]),
                Err(e) => tracing::warn!(error = %e, "resampling failed, dropping chunk"),
            }
            self.pending.drain(..needed);
        }

        output
    }
}

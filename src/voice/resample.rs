//! Streaming sample-rate conversion for the voice pipeline
//!
//! Wraps rubato's FFT resampler behind a push interface: the pipeline feeds
//! whatever chunk sizes the capture queue produces and complete resampler
//! chunks are emitted as they fill. Matching input and output rates becomes
//! a pass-through.

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Resampler input chunk size in frames
const CHUNK_SIZE: usize = 1024;

/// Number of FFT sub-chunks; controls latency vs transform size
const SUB_CHUNKS: usize = 2;

/// Push-driven mono resampler
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl StreamResampler {
    /// Create a resampler from `input_rate` to `output_rate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rate pair is not supported by the FFT
    /// resampler.
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        let inner = if input_rate == output_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    input_rate as usize,
                    output_rate as usize,
                    CHUNK_SIZE,
                    SUB_CHUNKS,
                    1,
                )
                .map_err(|e| Error::Voice(format!("resampler init failed: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
            input_rate,
            output_rate,
        })
    }

    /// Whether input passes through untouched
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Configured input rate
    #[must_use]
    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Configured output rate
    #[must_use]
    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Feed `samples`, appending any produced output to `out`.
    ///
    /// Input shorter than the internal chunk size is buffered until a full
    /// chunk is available, so output arrives in bursts of roughly
    /// `CHUNK_SIZE * output_rate / input_rate` frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying resampler fails.
    pub fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(samples);
            return Ok(());
        };

        self.pending.extend_from_slice(samples);

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let produced = resampler
                .process(&[chunk], None)
                .map_err(|e| Error::Voice(format!("resample failed: {e}")))?;
            out.extend_from_slice(&produced[0]);
        }

        Ok(())
    }
}

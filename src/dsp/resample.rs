//! Streaming sample-rate conversion.

use crate::defaults;
use crate::error::{RelayError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::Arc;

/// Stateful mono resampler fed with arbitrarily sized blocks.
///
/// This trait allows swapping implementations (sinc vs mock).
pub trait StreamResampler: Send {
    /// Resamples `samples`, returning whatever output is ready.
    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>>;

    /// Ends the signal: drains held input and filter delay, returning the
    /// remaining output, then resets.
    fn flush(&mut self) -> Result<Vec<f32>>;

    /// Drops all history so the next block starts a fresh signal.
    fn reset(&mut self);

    fn rate_in(&self) -> u32;

    fn rate_out(&self) -> u32;
}

/// Builds a resampler for a `(rate_in, rate_out)` pair.
pub type ResamplerFactory =
    Arc<dyn Fn(u32, u32) -> Result<Box<dyn StreamResampler>> + Send + Sync>;

/// Factory producing [`SincResampler`]s.
pub fn sinc_factory() -> ResamplerFactory {
    Arc::new(|rate_in, rate_out| {
        Ok(Box::new(SincResampler::new(rate_in, rate_out)?) as Box<dyn StreamResampler>)
    })
}

/// Upper bound on zero-padded chunks run by a flush.
const MAX_FLUSH_CHUNKS: usize = 32;

/// Band-limited sinc resampler.
///
/// rubato consumes fixed-size chunks, so input is staged until a full chunk
/// is available; the remainder carries over to the next call. The filter's
/// leading delay is dropped, so a flushed signal comes out aligned with the
/// input and `rate_out / rate_in` times as long.
pub struct SincResampler {
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
    rate_in: u32,
    rate_out: u32,
    delay_left: usize,
    consumed: u64,
    produced: u64,
}

impl SincResampler {
    pub fn new(rate_in: u32, rate_out: u32) -> Result<Self> {
        if rate_in == 0 || rate_out == 0 {
            return Err(RelayError::Resampler {
                message: format!("invalid rate pair {} -> {}", rate_in, rate_out),
            });
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = rate_out as f64 / rate_in as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 1.0, params, defaults::RESAMPLER_CHUNK, 1)
            .map_err(|e| RelayError::Resampler {
                message: format!("failed to create {} -> {} resampler: {}", rate_in, rate_out, e),
            })?;

        Ok(Self {
            delay_left: inner.output_delay(),
            inner,
            pending: Vec::with_capacity(defaults::RESAMPLER_CHUNK * 2),
            rate_in,
            rate_out,
            consumed: 0,
            produced: 0,
        })
    }

    fn run_chunk(&mut self, output: &mut Vec<f32>) -> Result<()> {
        let needed = self.inner.input_frames_next();
        let chunk: Vec<f32> = self.pending.drain(..needed).collect();
        let out = self
            .inner
            .process(&[chunk], None)
            .map_err(|e| RelayError::Resampler {
                message: format!("resampling failed: {}", e),
            })?;
        if let Some(channel) = out.first() {
            let skip = self.delay_left.min(channel.len());
            self.delay_left -= skip;
            output.extend_from_slice(&channel[skip..]);
            self.produced += (channel.len() - skip) as u64;
        }
        Ok(())
    }

    /// Output length owed for everything consumed since the last reset.
    fn expected_output(&self) -> u64 {
        (self.consumed as f64 * self.rate_out as f64 / self.rate_in as f64).round() as u64
    }
}

impl StreamResampler for SincResampler {
    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        self.consumed += samples.len() as u64;

        let mut output = Vec::new();
        while self.pending.len() >= self.inner.input_frames_next() {
            self.run_chunk(&mut output)?;
        }
        Ok(output)
    }

    fn flush(&mut self) -> Result<Vec<f32>> {
        let expected = self.expected_output();
        let mut output = Vec::new();
        let mut chunks = 0;
        while self.produced < expected && chunks < MAX_FLUSH_CHUNKS {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                self.pending.resize(needed, 0.0);
            }
            self.run_chunk(&mut output)?;
            chunks += 1;
        }

        // Padding can overshoot; trim back to the owed length.
        let excess = self.produced.saturating_sub(expected) as usize;
        output.truncate(output.len().saturating_sub(excess));
        self.reset();
        Ok(output)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
        self.delay_left = self.inner.output_delay();
        self.consumed = 0;
        self.produced = 0;
    }

    fn rate_in(&self) -> u32 {
        self.rate_in
    }

    fn rate_out(&self) -> u32 {
        self.rate_out
    }
}

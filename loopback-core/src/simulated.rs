//! # Simulated Loopback Module
//!
//! A deterministic stand-in for the audio hardware. It "plays" the buffer
//! into a virtual cable with a fixed gain, delay and polynomial nonlinearity
//! and "records" the result, so whole test cycles can run without devices.

use crate::audio::{CancelToken, LoopbackIo};
use crate::error::{LoopbackError, Result};
use crate::SampleBuffer;

/// Virtual loopback cable.
///
/// Each recorded sample is `gain * (x + square·x² + cubic·x³)` where `x` is
/// the played sample `latency_samples` earlier (silence before playback).
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedLoopback {
    gain: f32,
    latency_samples: usize,
    square: f32,
    cubic: f32,
}

impl Default for SimulatedLoopback {
    fn default() -> Self {
        Self::echo()
    }
}

impl SimulatedLoopback {
    /// A perfect cable: the recording equals the playback.
    pub fn echo() -> Self {
        Self {
            gain: 1.0,
            latency_samples: 0,
            square: 0.0,
            cubic: 0.0,
        }
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_latency(mut self, latency_samples: usize) -> Self {
        self.latency_samples = latency_samples;
        self
    }

    /// Adds second- and third-order terms, producing 2nd/3rd harmonics.
    pub fn with_distortion(mut self, square: f32, cubic: f32) -> Self {
        self.square = square;
        self.cubic = cubic;
        self
    }

    fn shape(&self, x: f32) -> f32 {
        self.gain * (x + self.square * x * x + self.cubic * x * x * x)
    }
}

impl LoopbackIo for SimulatedLoopback {
    fn play_and_record(
        &mut self,
        played: &SampleBuffer,
        capture_len: usize,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer> {
        if cancel.is_cancelled() {
            return Err(LoopbackError::Cancelled);
        }

        let source = played.samples();
        let recorded: Vec<f32> = (0..source.len())
            .map(|i| {
                i.checked_sub(self.latency_samples)
                    .map(|j| self.shape(source[j]))
                    .unwrap_or(0.0)
            })
            .collect();

        tracing::debug!(
            num_samples = recorded.len(),
            latency = self.latency_samples,
            "Simulated loopback pass"
        );
        Ok(SampleBuffer::new(recorded, played.sample_rate()).tail(capture_len))
    }
}

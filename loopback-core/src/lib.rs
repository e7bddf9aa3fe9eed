// loopback-core/src/lib.rs

//! The core logic for the audio loopback tester.
//! This crate generates a test tone, plays it while recording the round trip,
//! and measures RMS gain, THD and peak frequency of both signals. It is
//! completely headless and contains no UI code.

pub mod analysis;
pub mod audio;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod fft;
pub mod simulated;
pub mod tone;

pub use analysis::{DB_FLOOR, SpectralAnalyzer, to_db};
pub use audio::{CancelToken, CpalSession, LoopbackIo, SimulatedLoopback};
pub use config::LoopbackConfig;
pub use controller::{ControllerState, LoopbackController, NO_DATA, TestConfiguration, TestState};
pub use error::{LoopbackError, Result};

use serde::Serialize;

/// An ordered run of mono samples at a known sample rate.
///
/// Whichever stage produced the buffer owns it; analysis only borrows it.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square level of every sample, linear. Zero for an empty buffer.
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq = self
            .samples
            .iter()
            .fold(0.0_f64, |acc, &s| acc + (s as f64) * (s as f64));
        (sum_sq / self.samples.len() as f64).sqrt()
    }

    /// Copies the last `len` samples into a new buffer.
    ///
    /// Returns the whole buffer when it is shorter than `len`.
    pub fn tail(&self, len: usize) -> SampleBuffer {
        let start = self.samples.len().saturating_sub(len);
        SampleBuffer::new(self.samples[start..].to_vec(), self.sample_rate)
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Represents the result of analysing one sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// Root-mean-square level of the buffer (linear).
    pub rms_level: f64,
    /// Centre frequency of the strongest FFT bin below Nyquist, in Hz.
    pub peak_frequency_hz: f64,
    /// Total harmonic distortion relative to the fundamental, in percent.
    pub thd_percent: f64,
}

impl AnalysisResult {
    /// THD expressed in decibels relative to the fundamental.
    pub fn thd_db(&self) -> f64 {
        to_db(self.thd_percent / 100.0)
    }

    pub fn rms_db(&self) -> f64 {
        to_db(self.rms_level)
    }
}

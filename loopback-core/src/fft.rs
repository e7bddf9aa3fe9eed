//! # Fast Fourier Transform (FFT) Module
//!
//! This module turns a sample buffer into a magnitude spectrum for the
//! analyzer. It handles DC removal, windowing and the forward transform.
//!
//! ## Features
//! - Forward FFT of any buffer length using RustFFT
//! - Hann windowing for reduced spectral leakage
//! - DC offset removal so bin 0 does not mask low tones

use rustfft::{FftPlanner, num_complex::Complex};
use serde::Serialize;

/// Removes the DC offset from a signal by making its average value zero.
///
/// Recorded signals often carry a small bias from the converter, which would
/// otherwise leak into the lowest bins through the window.
fn remove_dc_offset(signal: &mut [f64]) {
    let len = signal.len();
    if len == 0 { return; }
    let avg = signal.iter().sum::<f64>() / len as f64;
    if avg.abs() > 1e-12 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Applies a Hann window to the input buffer to reduce spectral leakage.
///
/// The tone is rarely an exact number of periods long, so without tapering
/// the edges the fundamental would smear across the whole spectrum and swamp
/// the harmonics.
fn apply_hann_window(buffer: &mut [f64]) {
    let n = buffer.len();
    if n < 2 { return; }
    let n_minus_1 = (n - 1) as f64;
    for (i, sample) in buffer.iter_mut().enumerate() {
        let multiplier = 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n_minus_1).cos());
        *sample *= multiplier;
    }
}

/// Performs a forward FFT on a signal and returns the complex spectrum.
///
/// The signal goes through the following steps:
/// 1. DC offset removal
/// 2. Hann windowing
/// 3. Forward FFT of the full signal length
///
/// The input is never modified; the transform runs on a private copy.
pub fn perform_fft(signal: &[f32]) -> Vec<Complex<f64>> {
    let mut processed_signal: Vec<f64> = signal.iter().map(|&s| s as f64).collect();
    remove_dc_offset(&mut processed_signal);
    apply_hann_window(&mut processed_signal);

    let mut buffer: Vec<Complex<f64>> = processed_signal
        .into_iter()
        .map(|sample| Complex { re: sample, im: 0.0 })
        .collect();
    if buffer.is_empty() {
        return buffer;
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(buffer.len());
    fft.process(&mut buffer);
    buffer
}

/// Calculates the magnitude vector from a complex spectrum.
///
/// Only the bins below the Nyquist frequency are returned, since the upper
/// half of a real signal's spectrum mirrors the lower half.
pub fn spectrum_to_magnitudes(spectrum: &[Complex<f64>]) -> Vec<f64> {
    spectrum
        .iter()
        .take(spectrum.len() / 2)
        .map(|c| c.norm()) // .norm() is sqrt(re^2 + im^2)
        .collect()
}

/// Width of one FFT bin in Hz.
pub fn bin_width(sample_rate: u32, fft_len: usize) -> f64 {
    if fft_len == 0 {
        return 0.0;
    }
    sample_rate as f64 / fft_len as f64
}

/// Magnitude spectrum of one buffer, bins `0..n/2`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    pub bin_width_hz: f64,
    pub magnitudes: Vec<f64>,
}

impl Spectrum {
    pub fn from_signal(signal: &[f32], sample_rate: u32) -> Self {
        let complex = perform_fft(signal);
        Self {
            bin_width_hz: bin_width(sample_rate, complex.len()),
            magnitudes: spectrum_to_magnitudes(&complex),
        }
    }

    /// Frequency of the centre of bin `k`.
    pub fn frequency_of(&self, k: usize) -> f64 {
        k as f64 * self.bin_width_hz
    }

    /// `(frequency, magnitude)` pairs, in bin order.
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.magnitudes
            .iter()
            .enumerate()
            .map(|(k, &m)| (self.frequency_of(k), m))
            .collect()
    }
}

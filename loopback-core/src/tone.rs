//! # Tone Generator Module
//!
//! Produces the reference sine wave that is played through the loopback path.
//! Generation is pure: the same arguments always give the same samples.

use crate::SampleBuffer;
use crate::error::{LoopbackError, Result};

/// Checks that a frequency can be represented at the given sample rate.
///
/// The frequency must be finite, strictly positive and strictly below the
/// Nyquist frequency (`sample_rate_hz / 2`), otherwise the tone aliases.
pub fn validate_frequency(frequency_hz: f64, sample_rate_hz: u32) -> Result<()> {
    if sample_rate_hz == 0 {
        return Err(LoopbackError::InvalidParameter(
            "sample rate must be positive".to_string(),
        ));
    }
    let nyquist = sample_rate_hz as f64 / 2.0;
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 || frequency_hz >= nyquist {
        return Err(LoopbackError::InvalidParameter(format!(
            "frequency {frequency_hz} Hz must lie strictly between 0 and {nyquist} Hz"
        )));
    }
    Ok(())
}

/// Checks a normalized amplitude lies in `(0, 1]`.
pub fn validate_amplitude(amplitude: f32) -> Result<()> {
    if !(amplitude > 0.0 && amplitude <= 1.0) {
        return Err(LoopbackError::InvalidParameter(format!(
            "amplitude {amplitude} must lie in (0, 1]"
        )));
    }
    Ok(())
}

/// Generates `duration_samples` samples of
/// `amplitude * sin(2π * frequency_hz * n / sample_rate_hz)`.
///
/// # Errors
/// * `InvalidParameter` - frequency outside `(0, Nyquist)`, amplitude outside
///   `(0, 1]`, or a zero duration
pub fn generate(
    frequency_hz: f64,
    sample_rate_hz: u32,
    duration_samples: usize,
    amplitude: f32,
) -> Result<SampleBuffer> {
    validate_frequency(frequency_hz, sample_rate_hz)?;
    validate_amplitude(amplitude)?;
    if duration_samples == 0 {
        return Err(LoopbackError::InvalidParameter(
            "duration must be at least one sample".to_string(),
        ));
    }

    // Phase is computed per sample in f64 so long buffers do not drift.
    let step = 2.0 * std::f64::consts::PI * frequency_hz / sample_rate_hz as f64;
    let amplitude = amplitude as f64;
    let samples = (0..duration_samples)
        .map(|n| (amplitude * (step * n as f64).sin()) as f32)
        .collect();

    Ok(SampleBuffer::new(samples, sample_rate_hz))
}

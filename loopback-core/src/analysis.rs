//! # Spectral Analysis Module
//!
//! Measures RMS level, peak frequency and total harmonic distortion of a
//! sample buffer. The analyzer keeps no state between calls, so one instance
//! can be shared freely across threads.
//!
//! ## Conventions
//! - RMS is linear; decibel conversions go through [`to_db`]
//! - The peak frequency is the centre of the strongest bin below Nyquist
//! - THD is reported in percent for every signal

use crate::fft::Spectrum;
use crate::{AnalysisResult, SampleBuffer};

/// Lowest value [`to_db`] will report, used in place of `log10(0)`.
pub const DB_FLOOR: f64 = -200.0;

/// Half-width, in bins, of the band summed around the fundamental and each
/// harmonic. A Hann main lobe spans ±2 bins; the extra bin absorbs the
/// rounding of non-integer harmonic positions.
const HARMONIC_BAND_HALF_WIDTH: usize = 3;

/// Bins left out between the fundamental's band and the first bin counted as
/// harmonic power. This far out the fundamental's Hann sidelobes are more
/// than 55 dB down.
const HARMONIC_GUARD_BINS: usize = 3;

/// Spectra whose strongest bin is below this magnitude are treated as silence.
const SILENCE_MAGNITUDE: f64 = 1e-9;

/// Converts a linear amplitude ratio to decibels (`20·log10`).
///
/// Zero, negative and NaN inputs return [`DB_FLOOR`] instead of `-inf`/NaN.
pub fn to_db(value: f64) -> f64 {
    if !(value > 0.0) {
        return DB_FLOOR;
    }
    (20.0 * value.log10()).max(DB_FLOOR)
}

/// Stateless analyzer for RMS, peak frequency and THD.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpectralAnalyzer;

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyzes a buffer at the sample rate it carries.
    pub fn analyze(&self, buffer: &SampleBuffer) -> AnalysisResult {
        self.analyze_with_spectrum(buffer).0
    }

    /// Like [`analyze`](Self::analyze) but also hands back the magnitude
    /// spectrum the measurement was taken from.
    pub fn analyze_with_spectrum(&self, buffer: &SampleBuffer) -> (AnalysisResult, Spectrum) {
        let spectrum = self.spectrum(buffer);
        let result = measure(buffer.rms(), &spectrum);
        (result, spectrum)
    }

    /// Windowed magnitude spectrum of the buffer, up to Nyquist.
    pub fn spectrum(&self, buffer: &SampleBuffer) -> Spectrum {
        Spectrum::from_signal(buffer.samples(), buffer.sample_rate())
    }
}

fn measure(rms_level: f64, spectrum: &Spectrum) -> AnalysisResult {
    let magnitudes = &spectrum.magnitudes;
    let Some(peak_bin) = find_peak_bin(magnitudes) else {
        return AnalysisResult {
            rms_level,
            peak_frequency_hz: 0.0,
            thd_percent: 0.0,
        };
    };

    let fundamental_power = band_power(magnitudes, peak_bin, HARMONIC_BAND_HALF_WIDTH);
    let harmonic_power = harmonic_power(magnitudes, peak_bin);

    let thd_percent = if fundamental_power > 0.0 {
        100.0 * (harmonic_power / fundamental_power).sqrt()
    } else {
        0.0
    };

    AnalysisResult {
        rms_level,
        peak_frequency_hz: spectrum.frequency_of(peak_bin),
        thd_percent,
    }
}

/// Index of the strongest bin, ignoring DC. `None` for silence or a spectrum
/// too short to hold a positive-frequency bin.
fn find_peak_bin(magnitudes: &[f64]) -> Option<usize> {
    magnitudes
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .filter(|&(_, &m)| m > SILENCE_MAGNITUDE)
        .map(|(k, _)| k)
}

/// Sum of squared magnitudes over `centre ± half_width`, clipped to the spectrum.
fn band_power(magnitudes: &[f64], centre: usize, half_width: usize) -> f64 {
    let start = centre.saturating_sub(half_width);
    let end = (centre + half_width).min(magnitudes.len().saturating_sub(1));
    magnitudes[start..=end].iter().map(|m| m * m).sum()
}

/// Power summed over every harmonic band (2f, 3f, ...) that fits below Nyquist.
///
/// Only bins clear of the fundamental's band and guard are counted, and each
/// bin at most once. For very low tones this leaves out harmonics that sit on
/// the fundamental's own leakage and cannot be told apart from it.
fn harmonic_power(magnitudes: &[f64], peak_bin: usize) -> f64 {
    let half_width = HARMONIC_BAND_HALF_WIDTH;
    let fundamental_bin = interpolate_peak(magnitudes, peak_bin).max(1.0);
    let mut next_free = peak_bin + half_width + HARMONIC_GUARD_BINS + 1;
    let mut power = 0.0;
    for order in 2_usize.. {
        let centre = (fundamental_bin * order as f64).round() as usize;
        let end = centre + half_width;
        if end >= magnitudes.len() {
            break;
        }
        let start = centre.saturating_sub(half_width).max(next_free);
        if start > end {
            continue;
        }
        power += magnitudes[start..=end].iter().map(|m| m * m).sum::<f64>();
        next_free = end + 1;
    }
    power
}

/// Refines the peak position to a fractional bin.
///
/// Fits a parabola through the log magnitudes of the peak and its two
/// neighbours; high-order harmonics are placed from this estimate so the
/// quantisation error of the peak bin is not multiplied by the order.
fn interpolate_peak(magnitudes: &[f64], peak_bin: usize) -> f64 {
    let fallback = peak_bin as f64;
    if peak_bin == 0 || peak_bin + 1 >= magnitudes.len() {
        return fallback;
    }

    let y1 = magnitudes[peak_bin - 1].ln();
    let y2 = magnitudes[peak_bin].ln();
    let y3 = magnitudes[peak_bin + 1].ln();
    if !y1.is_finite() || !y2.is_finite() || !y3.is_finite() {
        return fallback;
    }

    let denominator = 2.0 * y2 - y1 - y3;
    if denominator.abs() < 1e-12 {
        return fallback;
    }

    let peak_shift = (y3 - y1) / (2.0 * denominator);
    if peak_shift.is_finite() && peak_shift.abs() <= 0.5 {
        fallback + peak_shift
    } else {
        fallback
    }
}

//! # Capture Module
//!
//! Writes the signals and spectra of a finished cycle to disk so a run can be
//! inspected in an audio editor or spreadsheet, and reads WAV files back for
//! offline analysis.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::SampleBuffer;
use crate::error::{LoopbackError, Result};
use crate::fft::Spectrum;

/// One side (generated or recorded) of a cycle, ready to be written.
pub struct CaptureSide<'a> {
    pub name: &'a str,
    pub buffer: &'a SampleBuffer,
    pub spectrum: &'a Spectrum,
}

#[derive(Serialize)]
struct SpectrumPoint {
    frequency_hz: f64,
    magnitude: f64,
}

/// Writes `<name>.wav` and `<name>_spectrum.json` for every side into `dir`,
/// creating the directory if needed. Returns the paths written.
pub fn write_cycle(dir: &Path, sides: &[CaptureSide<'_>]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .map_err(|e| LoopbackError::Capture(format!("cannot create {}: {e}", dir.display())))?;

    let mut written = Vec::with_capacity(sides.len() * 2);
    for side in sides {
        let wav_path = dir.join(format!("{}.wav", side.name));
        write_wav(&wav_path, side.buffer)?;
        written.push(wav_path);

        let spectrum_path = dir.join(format!("{}_spectrum.json", side.name));
        write_spectrum(&spectrum_path, side.spectrum)?;
        written.push(spectrum_path);
    }
    Ok(written)
}

/// Writes a mono 32-bit float WAV file.
pub fn write_wav(path: &Path, buffer: &SampleBuffer) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in buffer.samples() {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn write_spectrum(path: &Path, spectrum: &Spectrum) -> Result<()> {
    let points: Vec<SpectrumPoint> = spectrum
        .points()
        .into_iter()
        .map(|(frequency_hz, magnitude)| SpectrumPoint { frequency_hz, magnitude })
        .collect();
    let file = File::create(path)
        .map_err(|e| LoopbackError::Capture(format!("cannot create {}: {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &points)
        .map_err(|e| LoopbackError::Capture(format!("cannot write {}: {e}", path.display())))
}

/// Reads the first channel of a WAV file, scaling integer samples to ±1.0.
pub fn read_wav(path: &Path) -> Result<SampleBuffer> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mono = interleaved.into_iter().step_by(channels).collect();
    Ok(SampleBuffer::new(mono, spec.sample_rate))
}

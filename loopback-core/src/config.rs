//! # Configuration Module
//!
//! Fixed parameters of the test rig, read from a TOML file with `LOOPBACK_*`
//! environment overrides. The tone frequency is the only value callers change
//! at run time; everything here stays put for the controller's lifetime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LoopbackError, Result};
use crate::tone;

/// Frequency used at startup and whenever a caller supplies an unusable one.
pub const DEFAULT_FREQUENCY_HZ: u32 = 1000;

const ENV_PREFIX: &str = "LOOPBACK_";

/// Longest analysed window accepted, about 87 s at 48 kHz.
pub const MAX_DURATION_SAMPLES: usize = 1 << 22;

/// Longest lead-in accepted, in seconds of audio.
pub const MAX_SETTLE_SECONDS: u64 = 10;

/// Largest I/O allowance accepted on top of the tone's own duration.
pub const MAX_IO_TIMEOUT_MS: u64 = 60_000;

/// Which devices form the loopback pair. `None` selects the host default.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub output: Option<String>,
    pub input: Option<String>,
    /// Channel of the input device that carries the returning signal.
    pub input_channel: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoopbackConfig {
    pub sample_rate_hz: u32,
    /// Analysed buffer length; must be a power of two.
    pub duration_samples: usize,
    pub amplitude: f32,
    pub default_frequency_hz: u32,
    /// Lead-in played and recorded before the analysed window. Must exceed
    /// the round-trip latency of the rig.
    pub settle_samples: usize,
    /// Extra time allowed past the tone's own duration before I/O is abandoned.
    pub io_timeout_ms: u64,
    pub devices: DeviceConfig,
    /// When set, WAV and spectrum files of each cycle are written here.
    pub capture_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 48000,
            duration_samples: 16384,
            amplitude: 0.5,
            default_frequency_hz: DEFAULT_FREQUENCY_HZ,
            settle_samples: 4800,
            io_timeout_ms: 2000,
            devices: DeviceConfig::default(),
            capture_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl LoopbackConfig {
    /// Loads configuration, applies environment overrides and validates.
    ///
    /// With an explicit `path` the file must exist. Without one, built-in
    /// defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LoopbackError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| LoopbackError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Applies `LOOPBACK_*` overrides fetched through `lookup`.
    ///
    /// Taking the lookup as a closure keeps tests away from process-global
    /// environment variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(val) = get("SAMPLE_RATE_HZ") {
            self.sample_rate_hz = parse_override("SAMPLE_RATE_HZ", &val)?;
        }
        if let Some(val) = get("DURATION_SAMPLES") {
            self.duration_samples = parse_override("DURATION_SAMPLES", &val)?;
        }
        if let Some(val) = get("AMPLITUDE") {
            self.amplitude = parse_override("AMPLITUDE", &val)?;
        }
        if let Some(val) = get("DEFAULT_FREQUENCY_HZ") {
            self.default_frequency_hz = parse_override("DEFAULT_FREQUENCY_HZ", &val)?;
        }
        if let Some(val) = get("SETTLE_SAMPLES") {
            self.settle_samples = parse_override("SETTLE_SAMPLES", &val)?;
        }
        if let Some(val) = get("IO_TIMEOUT_MS") {
            self.io_timeout_ms = parse_override("IO_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = get("OUTPUT_DEVICE") {
            self.devices.output = Some(val);
        }
        if let Some(val) = get("INPUT_DEVICE") {
            self.devices.input = Some(val);
        }
        if let Some(val) = get("INPUT_CHANNEL") {
            self.devices.input_channel = parse_override("INPUT_CHANNEL", &val)?;
        }
        if let Some(val) = get("CAPTURE_DIR") {
            self.capture_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = get("LOG_LEVEL") {
            self.log_level = val;
        }
        Ok(())
    }

    /// Checks the fixed rig parameters before any test can run.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(LoopbackError::InvalidParameter(
                "sample_rate_hz must be positive".to_string(),
            ));
        }
        if self.duration_samples < 2 || !self.duration_samples.is_power_of_two() {
            return Err(LoopbackError::InvalidParameter(format!(
                "duration_samples {} must be a power of two of at least 2",
                self.duration_samples
            )));
        }
        if self.duration_samples > MAX_DURATION_SAMPLES {
            return Err(LoopbackError::InvalidParameter(format!(
                "duration_samples {} exceeds {MAX_DURATION_SAMPLES}",
                self.duration_samples
            )));
        }
        let max_settle = MAX_SETTLE_SECONDS * self.sample_rate_hz as u64;
        if self.settle_samples as u64 > max_settle {
            return Err(LoopbackError::InvalidParameter(format!(
                "settle_samples {} exceeds {MAX_SETTLE_SECONDS} s ({max_settle} samples)",
                self.settle_samples
            )));
        }
        if self.io_timeout_ms > MAX_IO_TIMEOUT_MS {
            return Err(LoopbackError::InvalidParameter(format!(
                "io_timeout_ms {} exceeds {MAX_IO_TIMEOUT_MS}",
                self.io_timeout_ms
            )));
        }
        tone::validate_amplitude(self.amplitude)?;
        tone::validate_frequency(self.default_frequency_hz as f64, self.sample_rate_hz)?;
        Ok(())
    }

    /// Total samples played per cycle: lead-in plus the analysed window.
    pub fn played_samples(&self) -> Result<usize> {
        self.settle_samples
            .checked_add(self.duration_samples)
            .ok_or_else(|| {
                LoopbackError::InvalidParameter(format!(
                    "settle_samples {} plus duration_samples {} overflows",
                    self.settle_samples, self.duration_samples
                ))
            })
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoopbackError::Config(format!("{ENV_PREFIX}{name}: cannot parse '{value}'")))
}

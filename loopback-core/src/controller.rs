//! # Loopback Controller Module
//!
//! The single entry point used by front ends. It holds the pending test
//! configuration and the last published results, and runs one
//! generate → play/record → analyze → publish cycle at a time.
//!
//! ## Concurrency
//! - `run_test` blocks while another cycle is in flight; `try_run_test`
//!   fails with `TestAlreadyInProgress` instead
//! - Results are published as one `Arc<TestState>`, so readers never see
//!   values from two different cycles
//! - A failed or cancelled cycle leaves the previous results untouched

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Duration;

use crate::analysis::{SpectralAnalyzer, to_db};
use crate::audio::{CancelToken, CpalSession, LoopbackIo};
use crate::capture::{self, CaptureSide};
use crate::config::{DEFAULT_FREQUENCY_HZ, LoopbackConfig};
use crate::error::{LoopbackError, Result};
use crate::{AnalysisResult, SampleBuffer, tone};

/// Value every getter returns before a cycle has completed.
pub const NO_DATA: f64 = f64::NAN;

/// Parameters of one test cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestConfiguration {
    pub frequency_hz: f64,
    pub sample_rate_hz: u32,
    pub duration_samples: usize,
    pub amplitude: f32,
}

/// Everything a completed cycle produced. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestState {
    pub configuration: TestConfiguration,
    pub generated: AnalysisResult,
    pub recorded: AnalysisResult,
    /// `20·log10(recorded RMS / generated RMS)`.
    pub rms_gain_db: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
}

/// Owns the loopback I/O path and the published results.
///
/// Create one per rig and share it with `Arc`; every method takes `&self`.
pub struct LoopbackController {
    config: LoopbackConfig,
    pending: Mutex<TestConfiguration>,
    io: Mutex<Box<dyn LoopbackIo>>,
    running: AtomicBool,
    cancel: CancelToken,
    published: RwLock<Option<Arc<TestState>>>,
    analyzer: SpectralAnalyzer,
}

/// Marks the controller Running for as long as it lives.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LoopbackController {
    /// Builds a controller around an injected I/O path.
    ///
    /// # Errors
    /// * `InvalidParameter` - the rig configuration fails validation
    pub fn new(config: LoopbackConfig, io: Box<dyn LoopbackIo>) -> Result<Self> {
        config.validate()?;
        let pending = TestConfiguration {
            frequency_hz: config.default_frequency_hz as f64,
            sample_rate_hz: config.sample_rate_hz,
            duration_samples: config.duration_samples,
            amplitude: config.amplitude,
        };
        Ok(Self {
            config,
            pending: Mutex::new(pending),
            io: Mutex::new(io),
            running: AtomicBool::new(false),
            cancel: CancelToken::new(),
            published: RwLock::new(None),
            analyzer: SpectralAnalyzer::new(),
        })
    }

    /// Builds a controller that drives the configured audio hardware.
    pub fn with_hardware(config: LoopbackConfig) -> Result<Self> {
        let session = CpalSession::new(
            config.devices.clone(),
            Duration::from_millis(config.io_timeout_ms),
        );
        Self::new(config, Box::new(session))
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        if self.running.load(Ordering::SeqCst) {
            ControllerState::Running
        } else {
            ControllerState::Idle
        }
    }

    /// The configuration the next cycle will use.
    pub fn pending_configuration(&self) -> TestConfiguration {
        *lock(&self.pending)
    }

    pub fn frequency(&self) -> f64 {
        self.pending_configuration().frequency_hz
    }

    /// Validates and stores a new test frequency.
    ///
    /// # Errors
    /// * `InvalidParameter` - zero, or at/above the Nyquist frequency
    pub fn try_set_frequency(&self, frequency_hz: u32) -> Result<()> {
        let mut pending = lock(&self.pending);
        tone::validate_frequency(frequency_hz as f64, pending.sample_rate_hz)?;
        pending.frequency_hz = frequency_hz as f64;
        Ok(())
    }

    /// Stores a new test frequency, substituting the 1000 Hz default for any
    /// value outside `(0, Nyquist)`. A cycle already in flight is unaffected.
    pub fn set_frequency(&self, frequency_hz: u32) {
        if let Err(e) = self.try_set_frequency(frequency_hz) {
            tracing::warn!("{e}; using {DEFAULT_FREQUENCY_HZ} Hz");
            lock(&self.pending).frequency_hz = DEFAULT_FREQUENCY_HZ as f64;
        }
    }

    /// Text form of [`set_frequency`](Self::set_frequency): anything that is
    /// not a whole number of hertz also falls back to the default.
    pub fn set_frequency_str(&self, text: &str) {
        match text.trim().parse::<u32>() {
            Ok(frequency_hz) => self.set_frequency(frequency_hz),
            Err(_) => {
                tracing::warn!("'{text}' is not a frequency; using {DEFAULT_FREQUENCY_HZ} Hz");
                lock(&self.pending).frequency_hz = DEFAULT_FREQUENCY_HZ as f64;
            }
        }
    }

    /// Runs one full cycle, waiting for any cycle already in flight.
    pub fn run_test(&self) -> Result<()> {
        let io = lock(&self.io);
        self.run_cycle(io)
    }

    /// Runs one full cycle unless another is already in flight.
    ///
    /// # Errors
    /// * `TestAlreadyInProgress` - another caller holds the I/O path
    pub fn try_run_test(&self) -> Result<()> {
        let io = match self.io.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(LoopbackError::TestAlreadyInProgress),
        };
        self.run_cycle(io)
    }

    /// Asks the in-flight cycle to stop. It ends with `Cancelled` and the
    /// previous results stay published. Has no effect while idle.
    pub fn cancel(&self) {
        if self.state() == ControllerState::Running {
            self.cancel.cancel();
        }
    }

    /// The last published results, if any cycle has completed.
    pub fn latest(&self) -> Option<Arc<TestState>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rms_gain_db(&self) -> f64 {
        self.read_metric(|s| s.rms_gain_db)
    }

    pub fn generated_thd(&self) -> f64 {
        self.read_metric(|s| s.generated.thd_percent)
    }

    pub fn generated_peak_frequency(&self) -> f64 {
        self.read_metric(|s| s.generated.peak_frequency_hz)
    }

    pub fn recorded_thd(&self) -> f64 {
        self.read_metric(|s| s.recorded.thd_percent)
    }

    pub fn recorded_peak_frequency(&self) -> f64 {
        self.read_metric(|s| s.recorded.peak_frequency_hz)
    }

    fn read_metric(&self, metric: impl Fn(&TestState) -> f64) -> f64 {
        self.latest().map(|s| metric(&s)).unwrap_or(NO_DATA)
    }

    fn run_cycle(&self, mut io: MutexGuard<'_, Box<dyn LoopbackIo>>) -> Result<()> {
        self.cancel.reset();
        let _running = RunningGuard::enter(&self.running);
        let configuration = self.pending_configuration();

        tracing::info!(frequency_hz = configuration.frequency_hz, "Starting loopback test");
        match self.execute(&mut **io, configuration) {
            Ok(state) => {
                tracing::info!(
                    rms_gain_db = state.rms_gain_db,
                    generated_thd = state.generated.thd_percent,
                    recorded_thd = state.recorded.thd_percent,
                    recorded_peak_hz = state.recorded.peak_frequency_hz,
                    "Loopback test complete"
                );
                *self
                    .published
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(state));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Loopback test failed, keeping previous results: {e}");
                Err(e)
            }
        }
    }

    fn execute(&self, io: &mut dyn LoopbackIo, configuration: TestConfiguration) -> Result<TestState> {
        // The lead-in is part of one continuous tone so playback has no seam.
        let played = tone::generate(
            configuration.frequency_hz,
            configuration.sample_rate_hz,
            self.config.played_samples()?,
            configuration.amplitude,
        )?;

        let recorded = io.play_and_record(&played, configuration.duration_samples, &self.cancel)?;
        if self.cancel.is_cancelled() {
            return Err(LoopbackError::Cancelled);
        }
        if recorded.len() != configuration.duration_samples {
            return Err(LoopbackError::StreamOverrun(format!(
                "expected {} recorded samples, got {}",
                configuration.duration_samples,
                recorded.len()
            )));
        }

        let generated = played.tail(configuration.duration_samples);
        let (generated_result, generated_spectrum) = self.analyzer.analyze_with_spectrum(&generated);
        let (recorded_result, recorded_spectrum) = self.analyzer.analyze_with_spectrum(&recorded);

        if let Some(dir) = &self.config.capture_dir {
            let sides = [
                CaptureSide { name: "generated", buffer: &generated, spectrum: &generated_spectrum },
                CaptureSide { name: "recorded", buffer: &recorded, spectrum: &recorded_spectrum },
            ];
            match capture::write_cycle(dir, &sides) {
                Ok(paths) => tracing::debug!(files = paths.len(), dir = %dir.display(), "Capture written"),
                Err(e) => tracing::warn!("Capture skipped: {e}"),
            }
        }

        Ok(TestState {
            configuration,
            generated: generated_result,
            recorded: recorded_result,
            rms_gain_db: gain_db(&generated, &recorded),
        })
    }
}

/// Voltage gain of `recorded` relative to `generated`, in dB.
fn gain_db(generated: &SampleBuffer, recorded: &SampleBuffer) -> f64 {
    let reference = generated.rms();
    if reference <= 0.0 {
        return crate::DB_FLOOR;
    }
    to_db(recorded.rms() / reference)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

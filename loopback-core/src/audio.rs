//! # Audio I/O Module
//!
//! This module owns the hardware side of a loopback cycle. It plays the
//! generated tone through an output device while recording the same number of
//! samples from an input device, using CPAL (Cross-Platform Audio Library).
//!
//! ## Features
//! - Named or default device selection for both directions
//! - f32 stream configuration at the requested sample rate
//! - Underrun / overrun detection from callback timestamps
//! - Cooperative cancellation and an explicit I/O deadline
//!
//! ## Alignment
//! Recording starts together with playback and collects as many samples as
//! were played. The caller keeps only the trailing window, so the leading
//! transient and the round-trip latency fall into the discarded lead-in.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{StreamError, SupportedStreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::SampleBuffer;
use crate::config::DeviceConfig;
use crate::error::{LoopbackError, Result};

pub use crate::simulated::SimulatedLoopback;

/// Number of captured chunks that may wait for the collecting thread before
/// the input stream is considered overrun.
const CHUNK_QUEUE_DEPTH: usize = 256;

/// How often the collecting thread wakes to check cancellation and deadlines.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A callback interval longer than this many buffer durations is a dropout.
const XRUN_TOLERANCE: f64 = 2.0;

/// Scheduling jitter allowed on top of [`XRUN_TOLERANCE`].
const XRUN_SLACK: Duration = Duration::from_millis(10);

/// Shared flag used to abort an in-flight cycle.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// One synchronized play-and-record pass over a loopback path.
///
/// Implementations play `played`, record the same number of samples starting
/// at playback start, and return the trailing `capture_len` samples. They
/// return once the recording is complete; playback still queued in the device
/// at that point is cut off, which only affects samples outside the returned
/// window. Every device handle is released before returning, whatever the
/// outcome.
pub trait LoopbackIo: Send {
    fn play_and_record(
        &mut self,
        played: &SampleBuffer,
        capture_len: usize,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer>;
}

/// Loopback through real audio hardware.
///
/// Devices are opened anew for each cycle and closed before
/// [`play_and_record`](LoopbackIo::play_and_record) returns.
#[derive(Debug, Clone)]
pub struct CpalSession {
    devices: DeviceConfig,
    io_timeout: Duration,
}

impl CpalSession {
    pub fn new(devices: DeviceConfig, io_timeout: Duration) -> Self {
        Self { devices, io_timeout }
    }
}

impl LoopbackIo for CpalSession {
    fn play_and_record(
        &mut self,
        played: &SampleBuffer,
        capture_len: usize,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer> {
        let sample_rate = played.sample_rate();
        let total = played.len();

        let host = cpal::default_host();
        let output = select_output_device(&host, self.devices.output.as_deref())?;
        let input = select_input_device(&host, self.devices.input.as_deref())?;

        let output_configs = output
            .supported_output_configs()
            .map_err(|e| LoopbackError::DeviceUnavailable(format!("output configs: {e}")))?
            .collect::<Vec<_>>();
        let output_config = find_supported_config(output_configs, sample_rate).ok_or_else(|| {
            LoopbackError::DeviceUnavailable(format!("no f32 output format at {sample_rate} Hz"))
        })?;

        let input_configs = input
            .supported_input_configs()
            .map_err(|e| LoopbackError::DeviceUnavailable(format!("input configs: {e}")))?
            .collect::<Vec<_>>();
        let input_config = find_supported_config(input_configs, sample_rate).ok_or_else(|| {
            LoopbackError::DeviceUnavailable(format!("no f32 input format at {sample_rate} Hz"))
        })?;

        let input_channels = input_config.channels() as usize;
        let channel = self.devices.input_channel;
        if channel >= input_channels {
            return Err(LoopbackError::DeviceUnavailable(format!(
                "input channel {channel} requested but the device has {input_channels}"
            )));
        }

        tracing::debug!(
            output = output.name().unwrap_or_default(),
            input = input.name().unwrap_or_default(),
            sample_rate,
            output_channels = output_config.channels(),
            input_channels,
            num_samples = total,
            "Starting loopback streams"
        );

        let flags = XrunFlags::default();
        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<f32>>(CHUNK_QUEUE_DEPTH);
        let (err_tx, err_rx) = crossbeam_channel::unbounded::<LoopbackError>();

        let output_stream = build_playback_stream(
            &output,
            output_config,
            Arc::new(played.samples().to_vec()),
            flags.underrun.clone(),
            err_tx.clone(),
        )?;
        let input_stream = build_capture_stream(
            &input,
            input_config,
            channel,
            chunk_tx,
            flags.overrun.clone(),
            err_tx,
        )?;

        // Dropping the guard pauses and closes both streams on every path out.
        let streams = ActiveStreams {
            output: output_stream,
            input: input_stream,
        };
        streams.start()?;

        let deadline = io_deadline(Instant::now(), total, sample_rate, self.io_timeout)?;
        let recorded = collect_samples(total, &chunk_rx, &err_rx, &flags, cancel, deadline)?;
        drop(streams);

        tracing::debug!(recorded = recorded.len(), "Loopback streams closed");
        Ok(SampleBuffer::new(recorded, sample_rate).tail(capture_len))
    }
}

/// Flags raised from the real-time callbacks.
#[derive(Debug, Clone, Default)]
struct XrunFlags {
    underrun: Arc<AtomicBool>,
    overrun: Arc<AtomicBool>,
}

struct ActiveStreams {
    output: cpal::Stream,
    input: cpal::Stream,
}

impl ActiveStreams {
    /// Starts capture first so the earliest played samples are not missed.
    fn start(&self) -> Result<()> {
        self.input
            .play()
            .map_err(|e| LoopbackError::DeviceUnavailable(format!("failed to start capture: {e}")))?;
        self.output
            .play()
            .map_err(|e| LoopbackError::DeviceUnavailable(format!("failed to start playback: {e}")))?;
        Ok(())
    }
}

impl Drop for ActiveStreams {
    fn drop(&mut self) {
        if let Err(e) = self.output.pause() {
            tracing::debug!("Error pausing output stream: {e}");
        }
        if let Err(e) = self.input.pause() {
            tracing::debug!("Error pausing input stream: {e}");
        }
    }
}

/// Joins the capture callback on the calling thread until `total` samples
/// have arrived, the cycle is cancelled, a stream fault is reported or the
/// deadline passes.
fn collect_samples(
    total: usize,
    chunk_rx: &Receiver<Vec<f32>>,
    err_rx: &Receiver<LoopbackError>,
    flags: &XrunFlags,
    cancel: &CancelToken,
    deadline: Instant,
) -> Result<Vec<f32>> {
    let mut recorded = Vec::with_capacity(total);
    let started = Instant::now();

    while recorded.len() < total {
        if cancel.is_cancelled() {
            return Err(LoopbackError::Cancelled);
        }
        if flags.overrun.load(Ordering::Relaxed) {
            return Err(LoopbackError::StreamOverrun(format!(
                "captured samples dropped after {} of {total}",
                recorded.len()
            )));
        }
        if flags.underrun.load(Ordering::Relaxed) {
            return Err(LoopbackError::StreamUnderrun(
                "playback callback missed its deadline".to_string(),
            ));
        }
        if Instant::now() >= deadline {
            let budget = deadline.saturating_duration_since(started);
            return Err(LoopbackError::Timeout(budget.as_millis() as u64));
        }

        crossbeam_channel::select! {
            recv(chunk_rx) -> msg => match msg {
                Ok(chunk) => {
                    let wanted = total - recorded.len();
                    recorded.extend_from_slice(&chunk[..chunk.len().min(wanted)]);
                }
                Err(_) => {
                    return Err(LoopbackError::DeviceUnavailable(
                        "input stream closed before capture finished".to_string(),
                    ));
                }
            },
            recv(err_rx) -> msg => {
                if let Ok(err) = msg {
                    return Err(err);
                }
            },
            default(POLL_INTERVAL) => {}
        }
    }

    Ok(recorded)
}

/// When a pass of `total` samples must have finished: the tone's own
/// duration plus the configured allowance.
fn io_deadline(now: Instant, total: usize, sample_rate: u32, io_timeout: Duration) -> Result<Instant> {
    let expected = Duration::from_secs_f64(total as f64 / sample_rate.max(1) as f64);
    expected
        .checked_add(io_timeout)
        .and_then(|allowed| now.checked_add(allowed))
        .ok_or_else(|| {
            LoopbackError::InvalidParameter(format!("I/O timeout {io_timeout:?} is out of range"))
        })
}

fn build_playback_stream(
    device: &cpal::Device,
    config: SupportedStreamConfig,
    samples: Arc<Vec<f32>>,
    underrun: Arc<AtomicBool>,
    err_tx: Sender<LoopbackError>,
) -> Result<cpal::Stream> {
    let channels = config.channels() as usize;
    let mut detector = XrunDetector::new(config.sample_rate().0);
    let mut last_playback: Option<cpal::StreamInstant> = None;
    let mut position = 0usize;
    let config: cpal::StreamConfig = config.into();

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                let playback = info.timestamp().playback;
                let elapsed = last_playback.and_then(|prev| playback.duration_since(&prev));
                last_playback = Some(playback);
                let frames = data.len() / channels.max(1);
                // Only a gap while the tone is still playing matters.
                if detector.observe(elapsed, frames) && position < samples.len() {
                    underrun.store(true, Ordering::Relaxed);
                }

                // The same mono sample goes to every output channel; silence once done.
                for frame in data.chunks_mut(channels.max(1)) {
                    let value = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(value);
                    position += 1;
                }
            },
            move |err| {
                tracing::error!("Audio output error: {err}");
                let _ = err_tx.send(classify_stream_error(err, Direction::Output));
            },
            None,
        )
        .map_err(|e| LoopbackError::DeviceUnavailable(format!("failed to build output stream: {e}")))
}

fn build_capture_stream(
    device: &cpal::Device,
    config: SupportedStreamConfig,
    channel: usize,
    chunk_tx: Sender<Vec<f32>>,
    overrun: Arc<AtomicBool>,
    err_tx: Sender<LoopbackError>,
) -> Result<cpal::Stream> {
    let channels = config.channels() as usize;
    let mut detector = XrunDetector::new(config.sample_rate().0);
    let mut last_capture: Option<cpal::StreamInstant> = None;
    let config: cpal::StreamConfig = config.into();

    device
        .build_input_stream(
            &config,
            move |data: &[f32], info: &cpal::InputCallbackInfo| {
                let capture = info.timestamp().capture;
                let elapsed = last_capture.and_then(|prev| capture.duration_since(&prev));
                last_capture = Some(capture);
                let frames = data.len() / channels.max(1);
                if detector.observe(elapsed, frames) {
                    overrun.store(true, Ordering::Relaxed);
                }

                let mono: Vec<f32> = data
                    .chunks(channels.max(1))
                    .filter_map(|frame| frame.get(channel).copied())
                    .collect();
                match chunk_tx.try_send(mono) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => overrun.store(true, Ordering::Relaxed),
                    // The collector has finished or given up; nothing left to do.
                    Err(TrySendError::Disconnected(_)) => {}
                }
            },
            move |err| {
                tracing::error!("Audio input error: {err}");
                let _ = err_tx.send(classify_stream_error(err, Direction::Input));
            },
            None,
        )
        .map_err(|e| LoopbackError::DeviceUnavailable(format!("failed to build input stream: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Output,
    Input,
}

/// Maps an asynchronous stream error onto the loopback error taxonomy.
///
/// Backends report xruns as backend-specific text, so the description is
/// inspected; anything unrecognised is a fault in the direction it came from.
fn classify_stream_error(err: StreamError, direction: Direction) -> LoopbackError {
    match err {
        StreamError::DeviceNotAvailable => {
            LoopbackError::DeviceUnavailable(format!("{direction:?} device disconnected"))
        }
        other => {
            let description = other.to_string();
            let lower = description.to_lowercase();
            if lower.contains("underrun") {
                LoopbackError::StreamUnderrun(description)
            } else if lower.contains("overrun") || lower.contains("overflow") {
                LoopbackError::StreamOverrun(description)
            } else {
                match direction {
                    Direction::Output => LoopbackError::StreamUnderrun(description),
                    Direction::Input => LoopbackError::StreamOverrun(description),
                }
            }
        }
    }
}

/// Detects dropouts from the spacing of successive callbacks.
///
/// If the stream clock advanced by much more than the previous callback's
/// frames could cover, the hardware ran past the data it was given.
#[derive(Debug, Clone)]
struct XrunDetector {
    sample_rate: u32,
    last_frames: Option<usize>,
}

impl XrunDetector {
    fn new(sample_rate: u32) -> Self {
        Self { sample_rate, last_frames: None }
    }

    /// Records a callback of `frames` frames arriving `elapsed` after the
    /// previous one. Returns `true` when a dropout is detected.
    fn observe(&mut self, elapsed: Option<Duration>, frames: usize) -> bool {
        let previous = self.last_frames.replace(frames);
        match (previous, elapsed) {
            (Some(prev_frames), Some(elapsed)) if self.sample_rate > 0 => {
                let covered = prev_frames as f64 / self.sample_rate as f64;
                elapsed.as_secs_f64() > covered * XRUN_TOLERANCE + XRUN_SLACK.as_secs_f64()
            }
            _ => false,
        }
    }
}

/// Finds the best supported stream configuration for the target sample rate.
///
/// This function searches through the device's configurations and selects
/// an f32 range that contains `target_rate`, preferring the fewest channels.
///
/// # Returns
/// * `Some(config)` - Matching configuration pinned to `target_rate`
/// * `None` - No f32 configuration supports the rate
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfig> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32 && c.channels() > 0)
        .filter(|c| c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0)
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(cpal::SampleRate(target_rate)))
}

fn select_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| LoopbackError::DeviceUnavailable("no default output device".to_string())),
        Some(wanted) => {
            let devices = host
                .output_devices()
                .map_err(|e| LoopbackError::DeviceUnavailable(format!("cannot list outputs: {e}")))?;
            find_named(devices, wanted)
                .ok_or_else(|| LoopbackError::DeviceUnavailable(format!("output device '{wanted}' not found")))
        }
    }
}

fn select_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| LoopbackError::DeviceUnavailable("no default input device".to_string())),
        Some(wanted) => {
            let devices = host
                .input_devices()
                .map_err(|e| LoopbackError::DeviceUnavailable(format!("cannot list inputs: {e}")))?;
            find_named(devices, wanted)
                .ok_or_else(|| LoopbackError::DeviceUnavailable(format!("input device '{wanted}' not found")))
        }
    }
}

fn find_named(devices: impl Iterator<Item = cpal::Device>, wanted: &str) -> Option<cpal::Device> {
    devices
        .into_iter()
        .find(|device| device.name().map(|n| n == wanted).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleFormat, SampleRate, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn supported_config_prefers_fewest_f32_channels() {
        let configs = vec![
            range(2, 44100, 96000, SampleFormat::F32),
            range(1, 8000, 48000, SampleFormat::I16),
            range(1, 8000, 48000, SampleFormat::F32),
        ];
        let chosen = find_supported_config(configs, 48000).unwrap();
        assert_eq!(chosen.channels(), 1);
        assert_eq!(chosen.sample_rate(), SampleRate(48000));
        assert_eq!(chosen.sample_format(), SampleFormat::F32);
    }

    #[test]
    fn supported_config_requires_the_rate_in_range() {
        let configs = vec![range(2, 8000, 44100, SampleFormat::F32)];
        assert!(find_supported_config(configs, 48000).is_none());
    }

    #[test]
    fn deadline_covers_the_tone_and_the_allowance() {
        let now = Instant::now();
        let deadline = io_deadline(now, 48000, 48000, Duration::from_millis(500)).unwrap();
        assert_eq!(deadline - now, Duration::from_millis(1500));
    }

    #[test]
    fn unbounded_timeout_is_an_error_not_a_panic() {
        let result = io_deadline(Instant::now(), 48000, 48000, Duration::MAX);
        assert!(matches!(result, Err(LoopbackError::InvalidParameter(_))));
    }

    #[test]
    fn detector_ignores_the_first_callback() {
        let mut detector = XrunDetector::new(48000);
        // Without a previous callback there is nothing to compare against.
        assert!(!detector.observe(Some(Duration::from_secs(5)), 480));
    }

    #[test]
    fn detector_accepts_regular_callbacks() {
        let mut detector = XrunDetector::new(48000);
        detector.observe(None, 480);
        for _ in 0..10 {
            assert!(!detector.observe(Some(Duration::from_millis(10)), 480));
        }
    }

    #[test]
    fn detector_flags_a_long_gap() {
        let mut detector = XrunDetector::new(48000);
        detector.observe(None, 480);
        assert!(!detector.observe(Some(Duration::from_millis(12)), 480));
        // 480 frames cover 10 ms; 100 ms between callbacks means lost audio.
        assert!(detector.observe(Some(Duration::from_millis(100)), 480));
    }

    #[test]
    fn stream_errors_are_classified() {
        assert!(matches!(
            classify_stream_error(StreamError::DeviceNotAvailable, Direction::Input),
            LoopbackError::DeviceUnavailable(_)
        ));
        let underrun = StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "ALSA buffer underrun".to_string(),
            },
        };
        assert!(matches!(
            classify_stream_error(underrun, Direction::Output),
            LoopbackError::StreamUnderrun(_)
        ));
        let unknown = StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "something odd".to_string(),
            },
        };
        assert!(matches!(
            classify_stream_error(unknown, Direction::Input),
            LoopbackError::StreamOverrun(_)
        ));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn collector_stops_on_cancellation() {
        let (_chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<f32>>(4);
        let (_err_tx, err_rx) = crossbeam_channel::unbounded::<LoopbackError>();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = collect_samples(
            16,
            &chunk_rx,
            &err_rx,
            &XrunFlags::default(),
            &cancel,
            Instant::now() + Duration::from_secs(5),
        );
        assert_eq!(result, Err(LoopbackError::Cancelled));
    }

    #[test]
    fn collector_assembles_chunks_in_order() {
        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<f32>>(4);
        let (_err_tx, err_rx) = crossbeam_channel::unbounded::<LoopbackError>();
        chunk_tx.send(vec![1.0, 2.0, 3.0]).unwrap();
        chunk_tx.send(vec![4.0, 5.0, 6.0]).unwrap();
        let recorded = collect_samples(
            5,
            &chunk_rx,
            &err_rx,
            &XrunFlags::default(),
            &CancelToken::new(),
            Instant::now() + Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(recorded, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn collector_times_out_without_data() {
        let (_chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<f32>>(4);
        let (_err_tx, err_rx) = crossbeam_channel::unbounded::<LoopbackError>();
        let result = collect_samples(
            16,
            &chunk_rx,
            &err_rx,
            &XrunFlags::default(),
            &CancelToken::new(),
            Instant::now() + Duration::from_millis(30),
        );
        assert!(matches!(result, Err(LoopbackError::Timeout(_))));
    }

    #[test]
    fn collector_reports_overrun_flag() {
        let (_chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<f32>>(4);
        let (_err_tx, err_rx) = crossbeam_channel::unbounded::<LoopbackError>();
        let flags = XrunFlags::default();
        flags.overrun.store(true, Ordering::Relaxed);
        let result = collect_samples(
            16,
            &chunk_rx,
            &err_rx,
            &flags,
            &CancelToken::new(),
            Instant::now() + Duration::from_secs(5),
        );
        assert!(matches!(result, Err(LoopbackError::StreamOverrun(_))));
    }

    #[test]
    fn collector_forwards_stream_errors() {
        let (_chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<f32>>(4);
        let (err_tx, err_rx) = crossbeam_channel::unbounded::<LoopbackError>();
        err_tx
            .send(LoopbackError::DeviceUnavailable("unplugged".to_string()))
            .unwrap();
        let result = collect_samples(
            16,
            &chunk_rx,
            &err_rx,
            &XrunFlags::default(),
            &CancelToken::new(),
            Instant::now() + Duration::from_secs(5),
        );
        assert_eq!(
            result,
            Err(LoopbackError::DeviceUnavailable("unplugged".to_string()))
        );
    }
}

//! End-to-end cycles through the controller using in-process loopback paths.

use approx::assert_relative_eq;
use crossbeam_channel::{Receiver, Sender, bounded};
use loopback_core::{
    CancelToken, ControllerState, LoopbackConfig, LoopbackController, LoopbackError, LoopbackIo,
    Result, SampleBuffer, SimulatedLoopback,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn rig() -> LoopbackConfig {
    LoopbackConfig {
        duration_samples: 8192,
        settle_samples: 1024,
        ..LoopbackConfig::default()
    }
}

fn controller_with(io: impl LoopbackIo + 'static) -> LoopbackController {
    LoopbackController::new(rig(), Box::new(io)).unwrap()
}

/// Fails every pass with a device error.
struct DeadDevice;

impl LoopbackIo for DeadDevice {
    fn play_and_record(&mut self, _: &SampleBuffer, _: usize, _: &CancelToken) -> Result<SampleBuffer> {
        Err(LoopbackError::DeviceUnavailable("unplugged".to_string()))
    }
}

/// Announces that a pass started, then spins until cancelled.
struct Stalled {
    started: Sender<()>,
}

impl LoopbackIo for Stalled {
    fn play_and_record(&mut self, _: &SampleBuffer, _: usize, cancel: &CancelToken) -> Result<SampleBuffer> {
        let _ = self.started.send(());
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        Err(LoopbackError::Cancelled)
    }
}

/// Echoes, but only after the test releases the gate.
struct Gated {
    started: Sender<()>,
    gate: Receiver<()>,
}

impl LoopbackIo for Gated {
    fn play_and_record(
        &mut self,
        played: &SampleBuffer,
        capture_len: usize,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer> {
        let _ = self.started.send(());
        let _ = self.gate.recv();
        SimulatedLoopback::echo().play_and_record(played, capture_len, cancel)
    }
}

#[test]
fn echo_cycle_reports_unity_gain_and_matching_metrics() {
    let controller = controller_with(SimulatedLoopback::echo());
    controller.set_frequency(1000);
    controller.run_test().unwrap();

    assert_relative_eq!(controller.rms_gain_db(), 0.0, epsilon = 1e-6);
    let bin_width = 48000.0 / 8192.0;
    assert!((controller.generated_peak_frequency() - 1000.0).abs() <= bin_width);
    assert_eq!(controller.generated_peak_frequency(), controller.recorded_peak_frequency());
    assert_relative_eq!(controller.generated_thd(), controller.recorded_thd(), epsilon = 1e-9);
    assert!(controller.recorded_thd() < 0.1);
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[test]
fn repeated_cycles_are_deterministic() {
    let controller = controller_with(SimulatedLoopback::echo().with_latency(100));
    controller.set_frequency(3150);
    controller.run_test().unwrap();
    let first = controller.latest().unwrap();
    controller.run_test().unwrap();
    let second = controller.latest().unwrap();
    assert_eq!(*first, *second);
}

#[test]
fn published_state_carries_the_configuration_it_ran_with() {
    let controller = controller_with(SimulatedLoopback::echo());
    controller.set_frequency(440);
    controller.run_test().unwrap();
    controller.set_frequency(880);

    let state = controller.latest().unwrap();
    assert_eq!(state.configuration.frequency_hz, 440.0);
    assert_eq!(state.configuration.duration_samples, 8192);
    assert_eq!(controller.frequency(), 880.0);
}

#[test]
fn attenuating_distorting_path_is_measured() {
    let controller = controller_with(
        SimulatedLoopback::echo()
            .with_gain(0.5)
            .with_latency(300)
            .with_distortion(0.0, 0.2),
    );
    controller.set_frequency(1000);
    controller.run_test().unwrap();

    // x + 0.2x³ at amplitude 0.5: fundamental 0.51875, third harmonic 0.00625.
    let fundamental: f64 = 0.5 + 0.75 * 0.2 * 0.125;
    let third: f64 = 0.25 * 0.2 * 0.125;
    let expected_gain_db = 20.0 * (0.5 * (fundamental * fundamental + third * third).sqrt() / 0.5).log10();
    assert_relative_eq!(controller.rms_gain_db(), expected_gain_db, epsilon = 0.05);
    assert_relative_eq!(controller.recorded_thd(), 100.0 * third / fundamental, max_relative = 0.05);
    assert!(controller.generated_thd() < 0.1);
}

#[test]
fn failed_cycle_keeps_no_data() {
    let controller = controller_with(DeadDevice);
    let err = controller.run_test().unwrap_err();
    assert!(matches!(err, LoopbackError::DeviceUnavailable(_)));
    assert!(controller.rms_gain_db().is_nan());
    assert!(controller.recorded_peak_frequency().is_nan());
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[test]
fn cancelled_cycle_keeps_the_previous_results() {
    let (started_tx, started_rx) = bounded(1);
    let controller = Arc::new(controller_with(Stalled { started: started_tx }));

    let worker = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || controller.run_test())
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(controller.state(), ControllerState::Running);

    controller.cancel();
    assert_eq!(worker.join().unwrap(), Err(LoopbackError::Cancelled));
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(controller.latest().is_none());
}

#[test]
fn second_caller_is_refused_while_a_cycle_runs() {
    let (started_tx, started_rx) = bounded(1);
    let (gate_tx, gate_rx) = bounded(1);
    let controller = Arc::new(controller_with(Gated {
        started: started_tx,
        gate: gate_rx,
    }));

    let worker = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || controller.run_test())
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(controller.try_run_test(), Err(LoopbackError::TestAlreadyInProgress));
    gate_tx.send(()).unwrap();
    worker.join().unwrap().unwrap();

    assert!(controller.latest().is_some());
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[test]
fn second_run_waits_for_the_cycle_in_flight() {
    let (started_tx, started_rx) = bounded(2);
    let (gate_tx, gate_rx) = bounded(2);
    let controller = Arc::new(controller_with(Gated {
        started: started_tx,
        gate: gate_rx,
    }));
    controller.set_frequency(440);

    let first = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || controller.run_test())
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The first cycle has already taken its snapshot at 440 Hz.
    controller.set_frequency(2000);
    let (done_tx, done_rx) = bounded(1);
    let second = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            let result = controller.run_test();
            let _ = done_tx.send(());
            result
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(started_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(controller.state(), ControllerState::Running);
    assert!(controller.latest().is_none());

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let state = controller.latest().unwrap();
    assert_eq!(state.configuration.frequency_hz, 2000.0);
    assert!((state.recorded.peak_frequency_hz - 2000.0).abs() <= 48000.0 / 8192.0);
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[test]
fn readers_never_observe_a_mixed_state() {
    let controller = Arc::new(controller_with(SimulatedLoopback::echo()));
    controller.set_frequency(1000);
    controller.run_test().unwrap();

    let writer = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            for hz in [500, 2000, 4000, 1000] {
                controller.set_frequency(hz);
                controller.run_test().unwrap();
            }
        })
    };

    while !writer.is_finished() {
        let state = controller.latest().unwrap();
        let bin_width = 48000.0 / 8192.0;
        assert!((state.recorded.peak_frequency_hz - state.configuration.frequency_hz).abs() <= bin_width);
        assert_eq!(state.generated.peak_frequency_hz, state.recorded.peak_frequency_hz);
    }
    writer.join().unwrap();
}

#[test]
fn capture_files_are_written_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoopbackConfig {
        capture_dir: Some(dir.path().to_path_buf()),
        ..rig()
    };
    let controller = LoopbackController::new(config, Box::new(SimulatedLoopback::echo())).unwrap();
    controller.run_test().unwrap();

    for name in ["generated.wav", "recorded.wav", "generated_spectrum.json", "recorded_spectrum.json"] {
        assert!(dir.path().join(name).exists(), "{name} missing");
    }
    let recorded = loopback_core::capture::read_wav(&dir.path().join("recorded.wav")).unwrap();
    assert_eq!(recorded.len(), 8192);
}

#[test]
fn highest_valid_frequency_runs() {
    let controller = controller_with(SimulatedLoopback::echo());
    controller.set_frequency(23999);
    assert_eq!(controller.frequency(), 23999.0);
    controller.run_test().unwrap();
    assert!(controller.recorded_peak_frequency() > 23000.0);
}

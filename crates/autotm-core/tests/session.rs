use autotm_core::prelude::*;
use autotm_core::protocol::{LineBuffer, MAX_LINE_BYTES};
use num_complex::Complex64;
use pretty_assertions::assert_eq;
use std::sync::mpsc::Receiver;
use std::time::Duration;

fn quiet_coil() -> CoilModel {
    CoilModel {
        noise_mv: 0.0,
        ..CoilModel::default()
    }
}

fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.connection.timeout_ms = 200;
    config.connection.poll_interval_ms = 1;
    config
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Session wired to a noiseless simulator
fn simulated_session() -> (AtmSession, SimulatorHandle, Receiver<AtmEvent>) {
    init_logging();
    let sim = SimulatedAtm::seeded(quiet_coil(), 42);
    let handle = sim.handle();
    let mut session = AtmSession::new(fast_config());
    session.attach_transport(Box::new(sim));
    let events = session.subscribe();
    (session, handle, events)
}

fn drain(events: &Receiver<AtmEvent>) -> Vec<AtmEvent> {
    events.try_iter().collect()
}

fn error_events(events: &[AtmEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, AtmEvent::Error(_)))
        .count()
}

/// Raw detector readings producing `gamma` with the default constants
fn raw_line(frequency_hz: f64, gamma: Complex64) -> String {
    let detector = DetectorConstants::default();
    let rl_db = -20.0 * gamma.norm().log10();
    let phase_deg = gamma.arg().to_degrees();
    format!(
        "f{}r{}p{}",
        frequency_hz,
        detector.center_magnitude_mv + rl_db * detector.magnitude_slope_mv_per_db,
        detector.center_phase_mv + phase_deg * detector.phase_slope_mv_per_deg
    )
}

/// Run a sweep of `kind` and feed it the given reflections by hand
fn capture(session: &mut AtmSession, handle: &SimulatorHandle, kind: Option<CalibrationKind>, gammas: &[Complex64]) {
    match kind {
        Some(kind) => session.start_calibration_sweep(kind, 80.0, 81.0).unwrap(),
        None => session.start_measurement_sweep(80.0, 81.0).unwrap(),
    }
    handle.clear_pending();
    for (i, gamma) in gammas.iter().enumerate() {
        session.handle_line(&raw_line(80e6 + i as f64 * 1e5, *gamma));
    }
    session.handle_line("r");
    assert_eq!(session.state(), SweepState::Idle);
}

#[test]
fn test_measurement_sweep_end_to_end() {
    let (mut session, handle, events) = simulated_session();

    // center the simulated resonance on 82 MHz
    session.set_voltages(2.5, 1.0).unwrap();
    session.start_measurement_sweep(81.0, 83.0).unwrap();
    assert_eq!(session.state(), SweepState::SweepingMeasurement);
    assert_eq!(
        handle.written(),
        vec!["v2.5v1".to_string(), "f81000000f83000000f5000".to_string()]
    );

    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());

    let measurement = session.measurement().unwrap();
    assert_eq!(measurement.len(), 401);
    let detector = session.config().detector;
    let (frequency, return_loss) = measurement.best_match(&detector).unwrap();
    assert_eq!(frequency, 82e6);
    assert!((return_loss - 30.0).abs() < 1e-9);

    let events = drain(&events);
    let points = events
        .iter()
        .filter(|e| matches!(e, AtmEvent::DataPointAdded(_)))
        .count();
    assert_eq!(points, 401);
    match events.last() {
        Some(AtmEvent::SweepFinished { dataset, .. }) => assert_eq!(dataset.len(), 401),
        other => panic!("Expected SweepFinished, got {:?}", other),
    }
}

#[test]
fn test_sample_at_detector_center() {
    let (mut session, handle, _events) = simulated_session();
    session.start_measurement_sweep(80.0, 81.0).unwrap();
    handle.clear_pending();

    session.handle_line("f1000000r900p1800");
    session.handle_line("r");

    let measurement = session.measurement().unwrap();
    let detector = session.config().detector;
    assert_eq!(measurement.samples(), &[RawSample::new(1e6, 900.0, 1800.0)]);
    assert_eq!(measurement.return_loss_db(&detector), vec![0.0]);
    assert_eq!(measurement.phase_deg(&detector), vec![0.0]);
}

#[test]
fn test_inverted_range_is_rejected_without_io() {
    let (mut session, handle, events) = simulated_session();

    let result = session.start_measurement_sweep(10.0, 5.0);
    assert!(matches!(result, Err(AtmError::Validation(_))));
    assert_eq!(session.state(), SweepState::Idle);
    assert_eq!(handle.bytes_written(), 0);
    assert!(drain(&events).is_empty());
}

#[test]
fn test_range_outside_synthesizer_is_rejected() {
    let (mut session, handle, _events) = simulated_session();

    assert!(matches!(
        session.start_measurement_sweep(30.0, 40.0),
        Err(AtmError::Validation(_))
    ));
    assert!(matches!(
        session.start_calibration_sweep(CalibrationKind::Open, 150.0, 250.0),
        Err(AtmError::Validation(_))
    ));
    assert_eq!(handle.bytes_written(), 0);
}

#[test]
fn test_second_procedure_is_busy() {
    let (mut session, handle, _events) = simulated_session();
    session.start_measurement_sweep(80.0, 81.0).unwrap();

    assert!(matches!(
        session.start_calibration_sweep(CalibrationKind::Short, 80.0, 81.0),
        Err(AtmError::Busy(SweepState::SweepingMeasurement))
    ));
    assert!(matches!(session.home(), Err(AtmError::Busy(_))));
    assert!(matches!(
        session.generate_lut(80.0, 81.0, 0.5),
        Err(AtmError::Busy(_))
    ));
    assert_eq!(handle.written().len(), 1);
}

#[test]
fn test_voltage_limits() {
    let (mut session, handle, _events) = simulated_session();
    assert!(matches!(
        session.set_voltages(5.5, 1.0),
        Err(AtmError::Validation(_))
    ));
    assert!(matches!(
        session.set_voltages(1.0, -0.1),
        Err(AtmError::Validation(_))
    ));
    assert!(matches!(
        session.set_voltages(f64::NAN, 1.0),
        Err(AtmError::Validation(_))
    ));
    assert_eq!(handle.bytes_written(), 0);

    session.set_voltages(5.0, 0.0).unwrap();
    assert_eq!(handle.voltages(), (5.0, 0.0));
}

#[test]
fn test_calibration_corrects_load_to_zero() {
    let (mut session, handle, events) = simulated_session();

    let short = [Complex64::new(-0.92, 0.08), Complex64::new(-0.9, 0.12), Complex64::new(-0.88, 0.15)];
    let open = [Complex64::new(0.85, 0.2), Complex64::new(0.83, 0.24), Complex64::new(0.8, 0.27)];
    let load = [Complex64::new(0.05, -0.02), Complex64::new(0.06, -0.01), Complex64::new(0.04, 0.01)];

    assert!(matches!(
        session.compute_calibration(),
        Err(AtmError::Calibration(CalibrationError::MissingSlot(CalibrationKind::Short)))
    ));

    capture(&mut session, &handle, Some(CalibrationKind::Short), &short);
    capture(&mut session, &handle, Some(CalibrationKind::Open), &open);
    capture(&mut session, &handle, Some(CalibrationKind::Load), &load);
    assert!(session.calibration().is_complete());
    assert_eq!(session.compute_calibration().unwrap().len(), 3);

    let slots: Vec<_> = drain(&events)
        .into_iter()
        .filter_map(|e| match e {
            AtmEvent::CalibrationSlotFinished { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(slots, CalibrationKind::ALL.to_vec());

    capture(&mut session, &handle, None, &load);
    let corrected = session.corrected_measurement().unwrap();
    assert_eq!(corrected.len(), 3);
    for gamma in corrected {
        assert!((gamma - CalibrationKind::Load.ideal_gamma()).norm() < 1e-9);
    }
}

#[test]
fn test_correction_requires_measurement_and_calibration() {
    let (mut session, handle, _events) = simulated_session();
    assert!(matches!(
        session.corrected_measurement(),
        Err(AtmError::NoMeasurement)
    ));

    capture(&mut session, &handle, None, &[Complex64::new(0.1, 0.0)]);
    assert!(matches!(
        session.corrected_measurement(),
        Err(AtmError::NoCalibration)
    ));
}

#[test]
fn test_calibration_export_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");

    let (mut session, handle, _events) = simulated_session();
    assert!(session.export_calibration(&path).is_err());

    capture(&mut session, &handle, Some(CalibrationKind::Short), &[Complex64::new(-0.95, 0.1)]);
    capture(&mut session, &handle, Some(CalibrationKind::Open), &[Complex64::new(0.9, -0.2)]);
    capture(&mut session, &handle, Some(CalibrationKind::Load), &[Complex64::new(0.03, 0.01)]);
    let expected = session.compute_calibration().unwrap().clone();
    session.export_calibration(&path).unwrap();

    let mut restored = AtmSession::new(fast_config());
    restored.import_calibration(&path).unwrap();
    assert!(restored.calibration().coefficients().is_none());
    assert_eq!(restored.compute_calibration().unwrap(), &expected);
}

#[test]
fn test_lut_generation_and_tune_and_match() {
    let (mut session, handle, events) = simulated_session();

    session.generate_lut(80.0, 80.3, 0.1).unwrap();
    assert_eq!(session.state(), SweepState::GeneratingLut);
    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());

    assert_eq!(
        handle.written(),
        vec!["s80000000", "s80100000", "s80200000"]
    );

    let lut = session.lut().unwrap();
    assert_eq!(lut.len(), 3);
    assert!(!lut.is_incomplete());

    let finished = drain(&events)
        .into_iter()
        .any(|e| matches!(e, AtmEvent::LutFinished { ref lut, .. } if lut.len() == 3));
    assert!(finished);

    let (tuning, matching) = session.tune_and_match(80.13).unwrap();
    assert_eq!((tuning, matching), (0.05, 2.5));
    assert_eq!(handle.written().last().map(String::as_str), Some("v2.5v0.05"));
}

#[test]
fn test_lut_generation_at_hertz_resolution() {
    let (mut session, handle, _events) = simulated_session();

    session.generate_lut(80.0, 80.000004, 0.000001).unwrap();
    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());

    assert_eq!(
        handle.written(),
        vec!["s80000000", "s80000001", "s80000002", "s80000003"]
    );
    let lut = session.lut().unwrap();
    assert_eq!(lut.len(), 4);
    assert!(!lut.is_incomplete());
}

#[test]
fn test_lut_step_below_one_hertz_is_rejected_without_io() {
    let (mut session, handle, _events) = simulated_session();
    assert!(matches!(
        session.generate_lut(80.0, 80.000004, 0.0000005),
        Err(AtmError::Validation(_))
    ));
    assert_eq!(session.state(), SweepState::Idle);
    assert_eq!(handle.bytes_written(), 0);
}

#[test]
fn test_oversized_lut_is_rejected_without_io() {
    let (mut session, handle, _events) = simulated_session();

    // 165 million entries, over the hard limit of the table
    assert!(matches!(
        session.generate_lut(35.0, 200.0, 0.000001),
        Err(AtmError::Validation(_))
    ));
    // 20000 entries, over the configured limit
    assert_eq!(session.config().sweep.max_lut_entries, 10_000);
    assert!(matches!(
        session.generate_lut(80.0, 100.0, 0.001),
        Err(AtmError::Validation(_))
    ));
    assert_eq!(session.state(), SweepState::Idle);
    assert!(session.lut().is_none());
    assert_eq!(handle.bytes_written(), 0);
}

#[test]
fn test_lut_entry_limit_is_configurable() {
    init_logging();
    let mut config = fast_config();
    config.sweep.max_lut_entries = 2;
    let sim = SimulatedAtm::seeded(quiet_coil(), 7);
    let handle = sim.handle();
    let mut session = AtmSession::new(config);
    session.attach_transport(Box::new(sim));

    assert!(matches!(
        session.generate_lut(80.0, 80.3, 0.1),
        Err(AtmError::Validation(_))
    ));
    session.generate_lut(80.0, 80.2, 0.1).unwrap();
    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());
    assert_eq!(handle.written(), vec!["s80000000", "s80100000"]);
}

#[test]
fn test_unconfirmed_step_aborts_lut_generation() {
    let (mut session, handle, events) = simulated_session();
    session.generate_lut(80.0, 80.3, 0.1).unwrap();
    drain(&events);

    // the board answers the first step, then stops confirming
    handle.set_confirmations(false);
    assert_eq!(session.process_incoming().unwrap(), 1);

    assert_eq!(session.state(), SweepState::Idle);
    assert!(session.lut().is_none());
    assert!(session.is_connected());
    assert_eq!(handle.written(), vec!["s80000000", "s80100000"]);

    let events = drain(&events);
    assert_eq!(error_events(&events), 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, AtmEvent::LutFinished { .. })));

    // the aborted table leaves the session usable
    handle.set_confirmations(true);
    session.generate_lut(80.0, 80.2, 0.1).unwrap();
    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());
    assert_eq!(session.lut().map(|l| l.len()), Some(2));
}

#[test]
fn test_tune_and_match_rejects_non_finite_target() {
    let (mut session, handle, _events) = simulated_session();
    session.generate_lut(80.0, 80.3, 0.1).unwrap();
    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());
    let written = handle.bytes_written();

    for target in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        assert!(matches!(
            session.tune_and_match(target),
            Err(AtmError::Validation(_))
        ));
    }
    assert_eq!(handle.bytes_written(), written);
}

/// Link that replays raw bytes through a [`LineBuffer`]
struct ByteReplay {
    buffer: LineBuffer,
}

impl LineTransport for ByteReplay {
    fn write_all(&mut self, _data: &[u8]) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn poll_line(&mut self) -> Result<Option<String>, ProtocolError> {
        self.buffer.pop_line().transpose()
    }

    fn is_open(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "byte-replay"
    }
}

#[test]
fn test_overlong_line_becomes_error_event() {
    init_logging();
    let mut buffer = LineBuffer::new();
    buffer.extend(&vec![b'i'; MAX_LINE_BYTES + 100]);
    buffer.extend(b"\niBoard ready\n");

    let mut session = AtmSession::new(fast_config());
    session.attach_transport(Box::new(ByteReplay { buffer }));
    let events = session.subscribe();

    assert_eq!(session.process_incoming().unwrap(), 0);
    assert_eq!(session.process_incoming().unwrap(), 1);
    assert!(session.is_connected());

    let events = drain(&events);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], AtmEvent::Error(text) if text.contains("Malformed line")));
    assert_eq!(events[1], AtmEvent::Info("Board ready".to_string()));
}

#[test]
fn test_tune_and_match_without_lut() {
    let (mut session, handle, _events) = simulated_session();
    assert!(matches!(
        session.tune_and_match(83.0),
        Err(AtmError::NoLutAvailable)
    ));
    assert_eq!(handle.bytes_written(), 0);
}

#[test]
fn test_lut_export_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lut.json");

    let (mut session, _handle, _events) = simulated_session();
    assert!(matches!(session.export_lut(&path), Err(AtmError::NoLutAvailable)));

    session.generate_lut(84.0, 85.0, 0.25).unwrap();
    assert!(session.wait_until_idle(Duration::from_secs(5)).unwrap());
    session.export_lut(&path).unwrap();

    let (mut restored, handle, _events) = simulated_session();
    restored.import_lut(&path).unwrap();
    assert_eq!(restored.lut().map(|l| l.entries()), session.lut().map(|l| l.entries()));

    restored.tune_and_match(84.5).unwrap();
    assert_eq!(handle.written(), vec!["v2.5v2.25"]);
}

#[test]
fn test_disconnect_aborts_sweep() {
    let (mut session, handle, events) = simulated_session();
    session.start_measurement_sweep(80.0, 81.0).unwrap();
    handle.clear_pending();
    session.handle_line("f80000000r900p1800");

    session.disconnect();

    assert_eq!(session.state(), SweepState::Idle);
    assert!(!session.is_connected());
    assert!(session.measurement().is_none());

    let events = drain(&events);
    assert_eq!(error_events(&events), 1);
    assert!(events.contains(&AtmEvent::ConnectionStateChanged {
        is_open: false,
        name: "simulated-atm".to_string(),
    }));

    // a late terminator no longer completes anything
    session.handle_line("r");
    assert!(session.measurement().is_none());
}

#[test]
fn test_lost_connection_aborts_lut_generation() {
    let (mut session, handle, events) = simulated_session();
    session.generate_lut(80.0, 81.0, 0.1).unwrap();
    handle.close();

    let result = session.process_incoming();
    assert!(matches!(
        result,
        Err(AtmError::Protocol(ProtocolError::ConnectionClosed))
    ));
    assert_eq!(session.state(), SweepState::Idle);
    assert!(session.lut().is_none());
    assert!(!session.is_connected());
    assert!(error_events(&drain(&events)) >= 1);
}

#[test]
fn test_command_without_connection() {
    let mut session = AtmSession::new(fast_config());
    let events = session.subscribe();

    let result = session.start_measurement_sweep(80.0, 81.0);
    assert!(matches!(
        result,
        Err(AtmError::Protocol(ProtocolError::NotConnected))
    ));
    assert_eq!(session.state(), SweepState::Idle);
    assert_eq!(error_events(&drain(&events)), 1);
}

#[test]
fn test_unconfirmed_command_times_out() {
    let (mut session, handle, events) = simulated_session();
    handle.set_confirmations(false);

    let result = session.start_measurement_sweep(80.0, 81.0);
    assert!(matches!(
        result,
        Err(AtmError::Protocol(ProtocolError::Timeout { .. }))
    ));
    assert_eq!(session.state(), SweepState::Idle);
    assert_eq!(error_events(&drain(&events)), 1);
}

#[test]
fn test_device_messages_become_events() {
    let (mut session, handle, events) = simulated_session();

    session.switch_rf_path(RfPath::Preamp).unwrap();
    assert_eq!(session.process_incoming().unwrap(), 1);
    session.home().unwrap();
    handle.push_line("eLimit switch stuck");
    assert_eq!(session.process_incoming().unwrap(), 2);

    assert_eq!(handle.written(), vec!["cp", "h"]);
    assert_eq!(
        drain(&events),
        vec![
            AtmEvent::Info("RF path: preamplifier".to_string()),
            AtmEvent::Info("Homing complete".to_string()),
            AtmEvent::Error("Device error: Limit switch stuck".to_string()),
        ]
    );
}

#[test]
fn test_malformed_and_stray_lines_are_reported() {
    let (mut session, _handle, events) = simulated_session();

    session.handle_line("");
    session.handle_line("x123");
    session.handle_line("fabcr1p2");
    // data outside a sweep
    session.handle_line("f80000000r900p1800");
    session.handle_line("v1.0t2.0");

    assert_eq!(session.state(), SweepState::Idle);
    assert!(session.measurement().is_none());
    assert_eq!(error_events(&drain(&events)), 5);
}

#[test]
fn test_observer_sees_connection_events() {
    use std::sync::{Arc, Mutex};

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut session = AtmSession::new(fast_config());
    session.observe(move |event| sink.lock().unwrap().push(event.clone()));
    session.attach_transport(Box::new(SimulatedAtm::seeded(quiet_coil(), 1)));
    session.disconnect();

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[
            AtmEvent::ConnectionStateChanged {
                is_open: true,
                name: "simulated-atm".to_string()
            },
            AtmEvent::ConnectionStateChanged {
                is_open: false,
                name: "simulated-atm".to_string()
            },
        ]
    );
}

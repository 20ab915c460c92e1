//! ATM session and sweep orchestration
//!
//! [`AtmSession`] owns everything that belongs to one instrument: the command
//! driver with its transport, the latest measurement, the calibration slots
//! and the lookup tables. It sequences the multi-step procedures:
//!
//! - reflection sweeps (`f` command, `f...` data lines, `r` terminator) for a
//!   measurement or one of the three calibration standards;
//! - LUT generation, one `s<frequency>` voltage search per table entry, each
//!   answered by a `v<matching>t<tuning>` line.
//!
//! Incoming lines are consumed by [`AtmSession::process_incoming`], which the
//! caller invokes whenever the transport may have data. Commands block until
//! the device confirms them; only one is ever in flight.

use num_complex::Complex64;
use std::fmt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::AtmError;
use crate::events::{AtmEvent, EventBus};
use crate::lut::LookupTable;
use crate::model::{
    apply_correction, CalibrationKind, CalibrationRecord, CalibrationSet, ErrorCoefficients,
    RawSample, S11Dataset,
};
use crate::protocol::{
    clear_buffers, configure_port, list_ports, open_port, parse_line, CommandDriver,
    DeviceCommand, DeviceLine, LineTransport, PortInfo, ProtocolError, RfPath, SerialTransport,
};

/// Procedure the session is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Ready for a new procedure
    Idle,
    /// Reflection sweep producing a measurement
    SweepingMeasurement,
    /// Reflection sweep of one calibration standard
    SweepingCalibration(CalibrationKind),
    /// Voltage searches filling a lookup table
    GeneratingLut,
}

impl SweepState {
    /// A reflection sweep of either kind is running
    pub fn is_sweeping(&self) -> bool {
        matches!(
            self,
            SweepState::SweepingMeasurement | SweepState::SweepingCalibration(_)
        )
    }
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepState::Idle => write!(f, "idle"),
            SweepState::SweepingMeasurement => write!(f, "measurement sweep"),
            SweepState::SweepingCalibration(kind) => write!(f, "{} calibration sweep", kind),
            SweepState::GeneratingLut => write!(f, "LUT generation"),
        }
    }
}

/// One connected (or connectable) ATM instrument
pub struct AtmSession {
    config: SessionConfig,
    driver: CommandDriver,
    events: EventBus,
    state: SweepState,
    /// Samples of the sweep in progress
    pending: Vec<RawSample>,
    started_at: Option<Instant>,
    measurement: Option<S11Dataset>,
    calibration: CalibrationSet,
    /// Table being filled during LUT generation
    lut_builder: Option<LookupTable>,
    /// Last finished (or imported) table
    lut: Option<LookupTable>,
    available_devices: Vec<PortInfo>,
}

impl Default for AtmSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl AtmSession {
    /// Disconnected session; nothing touches a port until [`AtmSession::connect`]
    pub fn new(config: SessionConfig) -> Self {
        let driver = CommandDriver::new(&config.connection);
        Self {
            config,
            driver,
            events: EventBus::new(),
            state: SweepState::Idle,
            pending: Vec::new(),
            started_at: None,
            measurement: None,
            calibration: CalibrationSet::new(),
            lut_builder: None,
            lut: None,
            available_devices: Vec::new(),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Procedure in progress
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Register a callback for every session event
    pub fn observe<F>(&mut self, observer: F)
    where
        F: Fn(&AtmEvent) + Send + 'static,
    {
        self.events.observe(observer);
    }

    /// Receive session events over a channel
    pub fn subscribe(&mut self) -> std::sync::mpsc::Receiver<AtmEvent> {
        self.events.subscribe()
    }

    /// Latest completed measurement sweep
    pub fn measurement(&self) -> Option<&S11Dataset> {
        self.measurement.as_ref()
    }

    /// Captured standards and computed error terms
    pub fn calibration(&self) -> &CalibrationSet {
        &self.calibration
    }

    /// Last finished or imported lookup table
    pub fn lut(&self) -> Option<&LookupTable> {
        self.lut.as_ref()
    }

    /// Ports found by the last [`AtmSession::find_devices`]
    pub fn available_devices(&self) -> &[PortInfo] {
        &self.available_devices
    }

    // ---- connection -------------------------------------------------------

    /// Scan for serial ports
    pub fn find_devices(&mut self) -> &[PortInfo] {
        self.available_devices = list_ports();
        let names = self
            .available_devices
            .iter()
            .map(|p| p.name.clone())
            .collect();
        self.events.emit(AtmEvent::AvailableDevicesChanged(names));
        &self.available_devices
    }

    /// A transport is attached and open
    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// Open the serial port of an ATM board
    pub fn connect(&mut self, port_name: &str) -> Result<(), AtmError> {
        if let Some(name) = self.driver.endpoint_name().filter(|_| self.is_connected()) {
            return Err(ProtocolError::AlreadyConnected(name).into());
        }

        info!("connecting to {}", port_name);
        let opened = open_port(port_name, Some(self.config.connection.baud_rate))
            .and_then(|mut port| {
                configure_port(&mut *port)?;
                clear_buffers(&mut *port)?;
                Ok(port)
            });

        match opened {
            Ok(port) => {
                self.config.connection.port_name = port_name.to_string();
                self.attach_transport(Box::new(SerialTransport::new(port)));
                Ok(())
            }
            Err(e) => {
                error!("could not connect to {}: {}", port_name, e);
                self.events
                    .emit(AtmEvent::Error(format!("Could not connect to {}: {}", port_name, e)));
                Err(e.into())
            }
        }
    }

    /// Use an already opened transport (simulator, test double, custom link)
    pub fn attach_transport(&mut self, transport: Box<dyn LineTransport>) {
        if self.state != SweepState::Idle {
            self.abort(format!("Transport replaced during {}", self.state));
        }
        let name = transport.name().to_string();
        let is_open = transport.is_open();
        if let Some(previous) = self.driver.attach(transport) {
            debug!("replaced transport {}", previous.name());
        }
        info!("connected to {}", name);
        self.events
            .emit(AtmEvent::ConnectionStateChanged { is_open, name });
    }

    /// Close the transport. An active procedure is aborted and its partial
    /// data discarded.
    pub fn disconnect(&mut self) {
        let Some(transport) = self.driver.detach() else {
            return;
        };
        let name = transport.name().to_string();
        drop(transport);

        if self.state != SweepState::Idle {
            self.abort(format!("Disconnected from {} during {}", name, self.state));
        }
        info!("disconnected from {}", name);
        self.events.emit(AtmEvent::ConnectionStateChanged {
            is_open: false,
            name,
        });
    }

    // ---- reflection sweeps --------------------------------------------------

    /// Sweep the reflection of the coil between two frequencies (MHz)
    pub fn start_measurement_sweep(&mut self, start_mhz: f64, stop_mhz: f64) -> Result<(), AtmError> {
        self.start_sweep(SweepState::SweepingMeasurement, start_mhz, stop_mhz)
    }

    /// Sweep one calibration standard between two frequencies (MHz)
    pub fn start_calibration_sweep(
        &mut self,
        kind: CalibrationKind,
        start_mhz: f64,
        stop_mhz: f64,
    ) -> Result<(), AtmError> {
        self.start_sweep(SweepState::SweepingCalibration(kind), start_mhz, stop_mhz)
    }

    fn start_sweep(&mut self, target: SweepState, start_mhz: f64, stop_mhz: f64) -> Result<(), AtmError> {
        self.ensure_idle()?;

        let start_hz = start_mhz * 1e6;
        let stop_hz = stop_mhz * 1e6;
        self.validate_sweep_range(start_hz, stop_hz)?;

        self.pending.clear();
        let step_hz = (stop_hz - start_hz) / f64::from(self.config.sweep.sweep_points.max(1));
        self.send(DeviceCommand::FrequencySweep {
            start_hz,
            stop_hz,
            step_hz,
        })?;

        info!("{} started: {} - {} MHz", target, start_mhz, stop_mhz);
        self.state = target;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn validate_sweep_range(&self, start_hz: f64, stop_hz: f64) -> Result<(), AtmError> {
        let limits = &self.config.sweep;
        if !(start_hz.is_finite() && stop_hz.is_finite()) {
            return Err(AtmError::Validation("sweep range must be finite".to_string()));
        }
        if start_hz < 0.0 || start_hz >= stop_hz {
            return Err(AtmError::Validation(format!(
                "start frequency {} MHz must be below stop frequency {} MHz",
                start_hz / 1e6,
                stop_hz / 1e6
            )));
        }
        if start_hz < limits.min_frequency_hz {
            return Err(AtmError::Validation(format!(
                "start frequency {} MHz is below the minimum of {} MHz",
                start_hz / 1e6,
                limits.min_frequency_hz / 1e6
            )));
        }
        if stop_hz > limits.max_frequency_hz {
            return Err(AtmError::Validation(format!(
                "stop frequency {} MHz is above the maximum of {} MHz",
                stop_hz / 1e6,
                limits.max_frequency_hz / 1e6
            )));
        }
        Ok(())
    }

    // ---- calibration --------------------------------------------------------

    /// Solve the error terms from the three captured standards
    pub fn compute_calibration(&mut self) -> Result<&ErrorCoefficients, AtmError> {
        let points = self.calibration.compute(&self.config.detector)?.len();
        info!("calibration computed over {} points", points);
        self.events
            .emit(AtmEvent::Info(format!("Calibration computed over {} points", points)));
        self.calibration
            .coefficients()
            .ok_or(AtmError::NoCalibration)
    }

    /// Latest measurement with the calibration applied
    pub fn corrected_measurement(&self) -> Result<Vec<Complex64>, AtmError> {
        let measurement = self.measurement.as_ref().ok_or(AtmError::NoMeasurement)?;
        let coefficients = self
            .calibration
            .coefficients()
            .ok_or(AtmError::NoCalibration)?;
        Ok(apply_correction(
            &measurement.gamma(&self.config.detector),
            coefficients,
        )?)
    }

    /// Save the three standards to a JSON file
    pub fn export_calibration<P: AsRef<Path>>(&self, path: P) -> Result<(), AtmError> {
        let path = path.as_ref();
        self.calibration.to_record()?.save(path)?;
        info!("calibration exported to {}", path.display());
        Ok(())
    }

    /// Replace the standards with those of a saved file
    pub fn import_calibration<P: AsRef<Path>>(&mut self, path: P) -> Result<(), AtmError> {
        self.ensure_idle()?;
        let path = path.as_ref();
        let record = CalibrationRecord::load(path)?;
        self.calibration = CalibrationSet::from_record(record);
        info!("calibration imported from {}", path.display());
        self.events.emit(AtmEvent::Info(format!(
            "Calibration imported from {}",
            path.display()
        )));
        Ok(())
    }

    // ---- voltages and LUT ---------------------------------------------------

    /// Apply varactor voltages directly
    pub fn set_voltages(&mut self, matching_v: f64, tuning_v: f64) -> Result<(), AtmError> {
        self.ensure_idle()?;
        let max = self.config.sweep.max_voltage;
        for (label, value) in [("matching", matching_v), ("tuning", tuning_v)] {
            if !value.is_finite() || value < 0.0 || value > max {
                return Err(AtmError::Validation(format!(
                    "{} voltage {} V outside 0 - {} V",
                    label, value, max
                )));
            }
        }
        self.send(DeviceCommand::SetVoltages {
            matching: matching_v,
            tuning: tuning_v,
        })
    }

    /// Build a voltage lookup table between two frequencies (MHz)
    pub fn generate_lut(&mut self, start_mhz: f64, stop_mhz: f64, step_mhz: f64) -> Result<(), AtmError> {
        self.ensure_idle()?;
        LookupTable::validate_range(start_mhz, stop_mhz, step_mhz)
            .map_err(|e| AtmError::Validation(e.to_string()))?;
        let entries = LookupTable::entry_count(start_mhz, stop_mhz, step_mhz);
        let limit = self.config.sweep.max_lut_entries;
        if entries > limit as f64 {
            return Err(AtmError::Validation(format!(
                "LUT would hold {} entries, the configured limit is {}",
                entries, limit
            )));
        }

        let mut lut = LookupTable::new(start_mhz, stop_mhz, step_mhz)?;
        let first = lut
            .start_next()
            .ok_or_else(|| AtmError::Validation("LUT range contains no frequency".to_string()))?;

        self.send(DeviceCommand::VoltageSweepStep {
            frequency_hz: first * 1e6,
        })?;

        info!(
            "LUT generation started: {} entries from {} to {} MHz",
            lut.len(),
            start_mhz,
            stop_mhz
        );
        self.lut_builder = Some(lut);
        self.state = SweepState::GeneratingLut;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Apply the LUT voltages nearest to `frequency_mhz`; returns `(tuning, matching)`
    pub fn tune_and_match(&mut self, frequency_mhz: f64) -> Result<(f64, f64), AtmError> {
        if !frequency_mhz.is_finite() {
            return Err(AtmError::Validation(format!(
                "target frequency {} MHz must be finite",
                frequency_mhz
            )));
        }
        let lut = self.lut.as_ref().ok_or(AtmError::NoLutAvailable)?;
        let entry = lut
            .nearest_entry(frequency_mhz)
            .ok_or(AtmError::NoLutAvailable)?;
        let (tuning, matching) = entry.voltages.pair().ok_or_else(|| {
            AtmError::Validation(format!("no voltages stored for {} MHz", entry.frequency))
        })?;

        debug!(
            "tune and match {} MHz using entry {} MHz",
            frequency_mhz, entry.frequency
        );
        self.set_voltages(matching, tuning)?;
        Ok((tuning, matching))
    }

    /// Save the current lookup table
    pub fn export_lut<P: AsRef<Path>>(&self, path: P) -> Result<(), AtmError> {
        let lut = self.lut.as_ref().ok_or(AtmError::NoLutAvailable)?;
        lut.save(path)?;
        Ok(())
    }

    /// Replace the current lookup table with a saved one
    pub fn import_lut<P: AsRef<Path>>(&mut self, path: P) -> Result<(), AtmError> {
        self.ensure_idle()?;
        let lut = LookupTable::load(path)?;
        if lut.is_incomplete() {
            warn!("imported LUT has unset entries");
        }
        self.lut = Some(lut);
        Ok(())
    }

    // ---- simple commands ----------------------------------------------------

    /// Route the RF signal through the preamplifier or the ATM
    pub fn switch_rf_path(&mut self, path: RfPath) -> Result<(), AtmError> {
        self.ensure_idle()?;
        self.send(DeviceCommand::SelectRfPath(path))
    }

    /// Send the actuators home
    pub fn home(&mut self) -> Result<(), AtmError> {
        self.ensure_idle()?;
        self.send(DeviceCommand::Home)
    }

    // ---- incoming lines -----------------------------------------------------

    /// Consume every line that has arrived and advance the state machine.
    /// Returns the number of lines handled.
    pub fn process_incoming(&mut self) -> Result<usize, AtmError> {
        let (lines, failure) = self.driver.read_available_lines();
        let count = lines.len();
        for line in &lines {
            self.handle_line(line);
        }

        match failure {
            None => Ok(count),
            // garbage on the line is reported like any unparsable line
            Some(e @ ProtocolError::MalformedLine { .. }) => {
                warn!("{}", e);
                self.events.emit(AtmEvent::Error(e.to_string()));
                Ok(count)
            }
            Some(e) => {
                if self.state != SweepState::Idle {
                    self.abort(format!("Connection lost during {}: {}", self.state, e));
                }
                if e.is_disconnect() {
                    self.disconnect();
                }
                Err(e.into())
            }
        }
    }

    /// Poll the transport until the session is idle again or `timeout` passes.
    /// Returns whether the session reached idle.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> Result<bool, AtmError> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.connection.poll_interval_ms.max(1));
        while self.state != SweepState::Idle {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if self.process_incoming()? == 0 {
                thread::sleep(poll);
            }
        }
        Ok(true)
    }

    /// Feed one received line into the state machine
    pub fn handle_line(&mut self, line: &str) {
        trace!("<- {}", line);
        let parsed = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{}", e);
                self.events.emit(AtmEvent::Error(e.to_string()));
                return;
            }
        };

        match parsed {
            DeviceLine::Info(text) => self.events.emit(AtmEvent::Info(text)),
            DeviceLine::DeviceError(text) => {
                warn!("device error: {}", text);
                self.events.emit(AtmEvent::Error(format!("Device error: {}", text)));
            }
            DeviceLine::DataPoint(sample) if self.state.is_sweeping() => {
                self.pending.push(sample);
                self.events.emit(AtmEvent::DataPointAdded(sample));
            }
            DeviceLine::SweepComplete if self.state.is_sweeping() => self.finish_sweep(),
            DeviceLine::VoltageResult { matching, tuning }
                if self.state == SweepState::GeneratingLut =>
            {
                self.on_voltage_result(matching, tuning)
            }
            unexpected => {
                let text = crate::protocol::codec::trim_line_ending(line);
                warn!("unexpected '{}' while {} ({:?})", text, self.state, unexpected);
                self.events.emit(AtmEvent::Error(format!(
                    "Unexpected line '{}' while {}",
                    text, self.state
                )));
            }
        }
    }

    fn finish_sweep(&mut self) {
        let dataset = S11Dataset::new(std::mem::take(&mut self.pending));
        let duration = self.elapsed();
        let finished = std::mem::replace(&mut self.state, SweepState::Idle);

        info!(
            "{} finished with {} points in {:.1}s",
            finished,
            dataset.len(),
            duration.as_secs_f64()
        );
        if let Some((frequency_hz, return_loss_db)) = dataset.best_match(&self.config.detector) {
            debug!(
                "best match at {:.3} MHz: {:.2} dB",
                frequency_hz / 1e6,
                return_loss_db
            );
        }

        match finished {
            SweepState::SweepingCalibration(kind) => {
                self.calibration.set(kind, dataset.clone());
                self.events.emit(AtmEvent::SweepFinished {
                    dataset: dataset.clone(),
                    duration,
                });
                self.events
                    .emit(AtmEvent::CalibrationSlotFinished { kind, dataset });
            }
            _ => {
                self.measurement = Some(dataset.clone());
                self.events
                    .emit(AtmEvent::SweepFinished { dataset, duration });
            }
        }
    }

    fn on_voltage_result(&mut self, matching: f64, tuning: f64) {
        enum Next {
            Step(f64),
            Complete,
            Failed(String),
        }

        let next = match self.lut_builder.as_mut() {
            None => Next::Failed("voltage result without a LUT in progress".to_string()),
            Some(lut) => {
                debug!(
                    "{:?} MHz: matching {} V, tuning {} V",
                    lut.started_frequency(),
                    matching,
                    tuning
                );
                match lut.add_voltages(matching, tuning) {
                    Err(e) => Next::Failed(e.to_string()),
                    Ok(()) => match lut.start_next() {
                        None => Next::Complete,
                        Some(frequency) => Next::Step(frequency),
                    },
                }
            }
        };

        match next {
            Next::Step(frequency) => {
                let command = DeviceCommand::VoltageSweepStep {
                    frequency_hz: frequency * 1e6,
                };
                if let Err(e) = self.driver.send(&command) {
                    self.abort(format!("LUT generation aborted at {} MHz: {}", frequency, e));
                }
            }
            Next::Complete => {
                let duration = self.elapsed();
                self.state = SweepState::Idle;
                if let Some(lut) = self.lut_builder.take() {
                    info!(
                        "LUT with {} entries finished in {:.1}s",
                        lut.len(),
                        duration.as_secs_f64()
                    );
                    self.lut = Some(lut.clone());
                    self.events.emit(AtmEvent::LutFinished { lut, duration });
                }
            }
            Next::Failed(reason) => self.abort(format!("LUT generation aborted: {}", reason)),
        }
    }

    // ---- helpers ------------------------------------------------------------

    fn ensure_idle(&self) -> Result<(), AtmError> {
        match self.state {
            SweepState::Idle => Ok(()),
            busy => Err(AtmError::Busy(busy)),
        }
    }

    fn elapsed(&mut self) -> Duration {
        self.started_at
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    /// Send through the driver; failures are also reported as an event
    fn send(&mut self, command: DeviceCommand) -> Result<(), AtmError> {
        self.driver.send(&command).map_err(|e| {
            error!("'{}' failed: {}", command, e);
            self.events
                .emit(AtmEvent::Error(format!("Command '{}' failed: {}", command, e)));
            AtmError::from(e)
        })
    }

    /// Return to idle, dropping everything the interrupted procedure collected
    fn abort(&mut self, reason: String) {
        error!("{}", reason);
        self.state = SweepState::Idle;
        self.pending.clear();
        self.lut_builder = None;
        self.started_at = None;
        self.events.emit(AtmEvent::Error(reason));
    }
}

impl fmt::Debug for AtmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtmSession")
            .field("state", &self.state)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .field("has_measurement", &self.measurement.is_some())
            .field("has_lut", &self.lut.is_some())
            .finish()
    }
}

//! Demo Mode - Simulated ATM instrument
//!
//! [`SimulatedAtm`] is a [`LineTransport`] that behaves like the ATM firmware:
//! it confirms every valid command with `c`, answers frequency sweeps with a
//! resonance dip and runs a (fake) voltage search for LUT steps. Useful for
//! UI work and tests without hardware on the bench.
//!
//! The coil is modelled as a single resonance whose center follows the
//! tuning voltage and whose depth depends on how close the matching voltage
//! is to its optimum.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::model::DetectorConstants;
use crate::protocol::{LineTransport, ProtocolError};

/// Resonance of the simulated coil
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoilModel {
    /// Resonance center with 0 V tuning (MHz)
    pub base_frequency_mhz: f64,
    /// Center shift per tuning volt (MHz/V)
    pub tuning_slope_mhz_per_v: f64,
    /// Matching voltage giving the deepest dip (V)
    pub optimal_matching_v: f64,
    /// Return loss at perfect match (dB)
    pub max_return_loss_db: f64,
    /// -3 dB width of the dip (MHz)
    pub bandwidth_mhz: f64,
    /// Peak-to-peak detector noise (mV)
    pub noise_mv: f64,
}

impl Default for CoilModel {
    fn default() -> Self {
        Self {
            base_frequency_mhz: 80.0,
            tuning_slope_mhz_per_v: 2.0,
            optimal_matching_v: 2.5,
            max_return_loss_db: 30.0,
            bandwidth_mhz: 0.4,
            noise_mv: 2.0,
        }
    }
}

impl CoilModel {
    fn center_mhz(&self, tuning_v: f64) -> f64 {
        self.base_frequency_mhz + tuning_v * self.tuning_slope_mhz_per_v
    }

    /// Return loss (dB) and phase (degrees) at `frequency_mhz`
    fn response(&self, frequency_mhz: f64, matching_v: f64, tuning_v: f64) -> (f64, f64) {
        let detuning = 2.0 * (frequency_mhz - self.center_mhz(tuning_v)) / self.bandwidth_mhz;
        let mismatch = (matching_v - self.optimal_matching_v).abs();
        let depth = self.max_return_loss_db / (1.0 + mismatch * mismatch);
        let return_loss = depth / (1.0 + detuning * detuning);
        let phase = -detuning.atan().to_degrees();
        (return_loss, phase)
    }

    /// Voltages the voltage search settles on for `frequency_mhz`
    fn solve(&self, frequency_mhz: f64, max_voltage: f64) -> (f64, f64) {
        let tuning = ((frequency_mhz - self.base_frequency_mhz) / self.tuning_slope_mhz_per_v)
            .clamp(0.0, max_voltage);
        (self.optimal_matching_v.min(max_voltage), tuning)
    }
}

#[derive(Debug)]
struct SimState {
    open: bool,
    confirm: bool,
    outgoing: VecDeque<String>,
    written: Vec<String>,
    matching_v: f64,
    tuning_v: f64,
    rng: StdRng,
}

/// Simulated ATM board
#[derive(Debug)]
pub struct SimulatedAtm {
    name: String,
    model: CoilModel,
    detector: DetectorConstants,
    max_voltage: f64,
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedAtm`] that stays usable after the
/// transport has been handed to a session
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for SimulatedAtm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAtm {
    /// Simulator with default coil and random noise
    pub fn new() -> Self {
        Self::with_rng(CoilModel::default(), StdRng::from_entropy())
    }

    /// Reproducible simulator
    pub fn seeded(model: CoilModel, seed: u64) -> Self {
        Self::with_rng(model, StdRng::seed_from_u64(seed))
    }

    fn with_rng(model: CoilModel, rng: StdRng) -> Self {
        Self {
            name: "simulated-atm".to_string(),
            model,
            detector: DetectorConstants::default(),
            max_voltage: 5.0,
            state: Arc::new(Mutex::new(SimState {
                open: true,
                confirm: true,
                outgoing: VecDeque::new(),
                written: Vec::new(),
                matching_v: 0.0,
                tuning_v: 0.0,
                rng,
            })),
        }
    }

    /// Handle that stays valid after the simulator is moved into a session
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Resonance being simulated
    pub fn model(&self) -> &CoilModel {
        &self.model
    }

    fn sample_line(&self, state: &mut SimState, frequency_hz: f64) -> String {
        let (return_loss, phase) =
            self.model
                .response(frequency_hz / 1e6, state.matching_v, state.tuning_v);
        let half_noise = self.model.noise_mv / 2.0;
        let mut noise = || {
            if half_noise > 0.0 {
                state.rng.gen_range(-half_noise..half_noise)
            } else {
                0.0
            }
        };
        let rl_mv = self.detector.center_magnitude_mv
            + return_loss * self.detector.magnitude_slope_mv_per_db
            + noise();
        let phase_mv =
            self.detector.center_phase_mv + phase * self.detector.phase_slope_mv_per_deg + noise();
        format!("f{}r{:.2}p{:.2}", frequency_hz, rl_mv, phase_mv)
    }

    /// React to one command frame, queueing the firmware's answers
    fn respond(&self, state: &mut SimState, command: &str) {
        let Some(opcode) = command.chars().next() else {
            state.outgoing.push_back("eEmpty command".to_string());
            return;
        };
        let args = &command[opcode.len_utf8()..];

        let answers = match opcode {
            'f' => self.frequency_sweep(state, args),
            'v' => self.set_voltages(state, args),
            's' => self.voltage_search(state, args),
            'c' => match args {
                "p" => Some(vec!["iRF path: preamplifier".to_string()]),
                "a" => Some(vec!["iRF path: ATM".to_string()]),
                _ => None,
            },
            'h' if args.is_empty() => Some(vec!["iHoming complete".to_string()]),
            _ => None,
        };

        match answers {
            Some(_) if !state.confirm => {}
            Some(lines) => {
                state.outgoing.push_back("c".to_string());
                state.outgoing.extend(lines);
            }
            None => state
                .outgoing
                .push_back(format!("eUnknown command '{}'", command)),
        }
    }

    fn frequency_sweep(&self, state: &mut SimState, args: &str) -> Option<Vec<String>> {
        let values = numbers(args, 'f')?;
        let [start, stop, step] = values[..] else {
            return None;
        };
        if step <= 0.0 || stop < start {
            return None;
        }

        let points = ((stop - start) / step).round() as usize;
        let mut lines: Vec<String> = (0..=points)
            .map(|i| self.sample_line(state, start + i as f64 * step))
            .collect();
        lines.push("r".to_string());
        Some(lines)
    }

    fn set_voltages(&self, state: &mut SimState, args: &str) -> Option<Vec<String>> {
        let values = numbers(args, 'v')?;
        let [matching, tuning] = values[..] else {
            return None;
        };
        state.matching_v = matching;
        state.tuning_v = tuning;
        Some(Vec::new())
    }

    fn voltage_search(&self, state: &mut SimState, args: &str) -> Option<Vec<String>> {
        let frequency_hz: f64 = args.parse().ok()?;
        let (matching, tuning) = self.model.solve(frequency_hz / 1e6, self.max_voltage);
        state.matching_v = matching;
        state.tuning_v = tuning;
        Some(vec![format!("v{:.3}t{:.3}", matching, tuning)])
    }
}

/// Split `a<sep>b<sep>c` into numbers
fn numbers(args: &str, separator: char) -> Option<Vec<f64>> {
    args.split(separator)
        .map(|part| part.parse::<f64>().ok())
        .collect()
}

impl LineTransport for SimulatedAtm {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let command = String::from_utf8_lossy(data).into_owned();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if !state.open {
            return Err(ProtocolError::ConnectionClosed);
        }
        trace!("simulator received '{}'", command);
        state.written.push(command.clone());
        self.respond(state, &command);
        Ok(())
    }

    fn poll_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Ok(None);
        }
        Ok(state.outgoing.pop_front())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl SimulatorHandle {
    /// Every command frame written so far
    pub fn written(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> usize {
        lock(&self.state).written.iter().map(String::len).sum()
    }

    /// Queue an unsolicited line
    pub fn push_line(&self, line: &str) {
        lock(&self.state).outgoing.push_back(line.to_string());
    }

    /// Drop the queued lines
    pub fn clear_pending(&self) {
        lock(&self.state).outgoing.clear();
    }

    /// Make the board swallow valid commands without any answer
    pub fn set_confirmations(&self, enabled: bool) {
        lock(&self.state).confirm = enabled;
    }

    /// Simulate unplugging the board
    pub fn close(&self) {
        debug!("simulated ATM closed");
        let mut state = lock(&self.state);
        state.open = false;
        state.outgoing.clear();
    }

    /// False once [`SimulatorHandle::close`] was called
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Last voltages applied, `(matching, tuning)`
    pub fn voltages(&self) -> (f64, f64) {
        let state = lock(&self.state);
        (state.matching_v, state.tuning_v)
    }
}

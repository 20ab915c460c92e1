//! Protocol commands
//!
//! Defines the commands understood by the ATM instrument firmware and their
//! text frames.

use serde::{Deserialize, Serialize};
use std::fmt;

/// RF path selected by the relay on the ATM board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RfPath {
    /// Route the coil to the preamplifier (measurement)
    Preamp,
    /// Route the coil to the ATM reflection bridge
    Atm,
}

impl RfPath {
    /// Second byte of the `c` path-select command
    pub fn selector(&self) -> char {
        match self {
            RfPath::Preamp => 'p',
            RfPath::Atm => 'a',
        }
    }
}

impl fmt::Display for RfPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RfPath::Preamp => write!(f, "preamp"),
            RfPath::Atm => write!(f, "atm"),
        }
    }
}

/// Commands sent to the ATM instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DeviceCommand {
    /// Reflection sweep from `start_hz` to `stop_hz` in `step_hz` increments
    FrequencySweep {
        /// First frequency (Hz)
        start_hz: f64,
        /// Last frequency (Hz)
        stop_hz: f64,
        /// Increment (Hz)
        step_hz: f64,
    },

    /// Apply the varactor control voltages
    SetVoltages {
        /// Matching varactor voltage (V)
        matching: f64,
        /// Tuning varactor voltage (V)
        tuning: f64,
    },

    /// Run the voltage search for one LUT frequency
    VoltageSweepStep {
        /// Target frequency (Hz)
        frequency_hz: f64,
    },

    /// Switch the RF relay
    SelectRfPath(RfPath),

    /// Drive the actuators to their home position
    Home,
}

impl DeviceCommand {
    /// Render the command as its wire frame
    pub fn to_wire(&self) -> String {
        match self {
            DeviceCommand::FrequencySweep {
                start_hz,
                stop_hz,
                step_hz,
            } => format!(
                "f{}f{}f{}",
                format_hertz(*start_hz),
                format_hertz(*stop_hz),
                format_hertz(*step_hz)
            ),
            DeviceCommand::SetVoltages { matching, tuning } => {
                format!("v{}v{}", format_decimal(*matching), format_decimal(*tuning))
            }
            DeviceCommand::VoltageSweepStep { frequency_hz } => {
                format!("s{}", format_hertz(*frequency_hz))
            }
            DeviceCommand::SelectRfPath(path) => format!("c{}", path.selector()),
            DeviceCommand::Home => "h".to_string(),
        }
    }

    /// Wire frame as raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire().into_bytes()
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Whole hertz, no exponent, no grouping
pub fn format_hertz(value: f64) -> String {
    format!("{}", value.round() as i64)
}

/// Plain decimal with `.` as separator.
///
/// Rust's float formatting never consults the locale and never switches to
/// exponent notation, so `Display` is already the wire format. Negative zero
/// is normalised so the device never sees `-0`.
pub fn format_decimal(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_sweep_frame() {
        let cmd = DeviceCommand::FrequencySweep {
            start_hz: 80e6,
            stop_hz: 84e6,
            step_hz: 10_000.0,
        };
        assert_eq!(cmd.to_wire(), "f80000000f84000000f10000");
    }

    #[test]
    fn test_fractional_step_rounds_to_hertz() {
        let cmd = DeviceCommand::FrequencySweep {
            start_hz: 35e6,
            stop_hz: 36e6,
            step_hz: 2_500.4,
        };
        assert_eq!(cmd.to_wire(), "f35000000f36000000f2500");
    }

    #[test]
    fn test_set_voltages_frame() {
        let cmd = DeviceCommand::SetVoltages {
            matching: 1.25,
            tuning: 0.5,
        };
        assert_eq!(cmd.to_wire(), "v1.25v0.5");
    }

    #[test]
    fn test_voltage_sweep_step_frame() {
        let cmd = DeviceCommand::VoltageSweepStep {
            frequency_hz: 80.1e6,
        };
        assert_eq!(cmd.to_wire(), "s80100000");
    }

    #[test]
    fn test_path_and_home_frames() {
        assert_eq!(DeviceCommand::SelectRfPath(RfPath::Preamp).to_wire(), "cp");
        assert_eq!(DeviceCommand::SelectRfPath(RfPath::Atm).to_wire(), "ca");
        assert_eq!(DeviceCommand::Home.to_bytes(), b"h".to_vec());
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(3.0), "3");
        assert_eq!(format_decimal(-0.0), "0");
        assert_eq!(format_decimal(0.125), "0.125");
        assert_eq!(format_decimal(1e-7), "0.0000001");
    }
}

//! Session configuration
//!
//! Settings for the serial link, the sweep limits of the instrument and the
//! detector transfer constants. Every section has sensible defaults and can be
//! loaded from (or saved to) a JSON file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::model::DetectorConstants;
use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_TIMEOUT_MS};

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Time to wait for a command confirmation in milliseconds
    pub timeout_ms: u64,
    /// Transport poll interval while waiting in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Limits of the frequency synthesizer and the varactor drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Lowest frequency the synthesizer can produce (Hz)
    pub min_frequency_hz: f64,
    /// Highest frequency the synthesizer can produce (Hz)
    pub max_frequency_hz: f64,
    /// Number of steps a reflection sweep is divided into
    pub sweep_points: u32,
    /// Highest voltage the varactor drivers accept (V)
    pub max_voltage: f64,
    /// Largest lookup table a LUT generation may build
    pub max_lut_entries: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            min_frequency_hz: 35e6,
            max_frequency_hz: 200e6,
            sweep_points: 400,
            max_voltage: 5.0,
            max_lut_entries: 10_000,
        }
    }
}

/// Complete configuration of an ATM session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial link
    pub connection: ConnectionConfig,
    /// Instrument limits
    pub sweep: SweepSettings,
    /// Detector transfer constants
    pub detector: DetectorConstants,
}

impl SessionConfig {
    /// Load a configuration file; missing keys take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }
}

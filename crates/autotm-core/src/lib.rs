//! # AutoTM Core Library
//!
//! Core functionality for driving an automatic tuning and matching (ATM)
//! instrument for NQR/NMR coils.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The line-oriented serial protocol of the ATM board
//! - Reflection (S11) sweeps and their raw datasets
//! - One-port short/open/load calibration
//! - Voltage lookup tables for tuning and matching
//! - A simulated instrument for testing without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use autotm_core::prelude::*;
//! use std::time::Duration;
//!
//! let mut session = AtmSession::default();
//! session.connect("/dev/ttyACM0")?;
//!
//! session.start_measurement_sweep(80.0, 84.0)?;
//! session.wait_until_idle(Duration::from_secs(30))?;
//!
//! let detector = session.config().detector;
//! if let Some((frequency, return_loss)) = session.measurement().and_then(|m| m.best_match(&detector)) {
//!     println!("best match at {} MHz: {} dB", frequency / 1e6, return_loss);
//! }
//! ```

pub mod config;
pub mod demo;
pub mod error;
pub mod events;
pub mod lut;
pub mod model;
pub mod protocol;
pub mod session;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConnectionConfig, SessionConfig, SweepSettings};
    pub use crate::demo::{CoilModel, SimulatedAtm, SimulatorHandle};
    pub use crate::error::AtmError;
    pub use crate::events::{AtmEvent, EventBus};
    pub use crate::lut::{LookupTable, LutEntry, LutError, VoltagePoint};
    pub use crate::model::{
        CalibrationError, CalibrationKind, CalibrationSet, DetectorConstants, ErrorCoefficients,
        RawSample, S11Dataset,
    };
    pub use crate::protocol::{
        CommandDriver, DeviceCommand, DeviceLine, LineTransport, ProtocolError, RfPath,
    };
    pub use crate::session::{AtmSession, SweepState};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Session errors

use thiserror::Error;

use crate::lut::LutError;
use crate::model::CalibrationError;
use crate::protocol::ProtocolError;
use crate::session::SweepState;

/// Errors returned by [`AtmSession`](crate::session::AtmSession) operations
#[derive(Error, Debug)]
pub enum AtmError {
    /// Rejected before any I/O
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Another procedure is running
    #[error("Device is busy ({0})")]
    Busy(SweepState),

    /// No finished or imported LUT
    #[error("No lookup table available")]
    NoLutAvailable,

    /// No measurement sweep has completed
    #[error("No measurement available")]
    NoMeasurement,

    /// Error terms not computed or imported
    #[error("No calibration computed")]
    NoCalibration,

    /// Link or device failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Calibration math or file failure
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Lookup table failure
    #[error(transparent)]
    Lut(#[from] LutError),
}

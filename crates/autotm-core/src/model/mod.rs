//! Measurement data model
//!
//! Raw detector samples, the S11 datasets built from them and the one-port
//! calibration math. Nothing in here performs device I/O.

mod calibration;
mod sample;

pub use calibration::{
    apply_correction, compute_error_coefficients, CalibrationKind, CalibrationRecord,
    CalibrationSet, ErrorCoefficients, SINGULAR_THRESHOLD,
};
pub use sample::{DatasetRecord, DetectorConstants, RawSample, S11Dataset};

use thiserror::Error;

/// Errors raised by calibration and dataset handling
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// A standard has not been measured
    #[error("No {0} calibration measured")]
    MissingSlot(CalibrationKind),

    /// The three standards have different point counts
    #[error("Calibration sweeps differ in length: short={short}, open={open}, load={load}")]
    LengthMismatch {
        /// Points of the short sweep
        short: usize,
        /// Points of the open sweep
        open: usize,
        /// Points of the load sweep
        load: usize,
    },

    /// Short and open coincide, the error terms are undefined
    #[error("Short and open measurements coincide at index {index} ({frequency_hz} Hz)")]
    SingularDenominator {
        /// Sample index
        index: usize,
        /// Frequency of that sample
        frequency_hz: f64,
    },

    /// Arrays of a dataset record differ in length
    #[error("Dataset arrays differ in length: frequency={frequency}, return_loss={return_loss}, phase={phase}")]
    RecordLengthMismatch {
        /// Length of the frequency array
        frequency: usize,
        /// Length of the return loss array
        return_loss: usize,
        /// Length of the phase array
        phase: usize,
    },

    /// Measurement and coefficients cover different point counts
    #[error("Measurement has {measured} points but calibration has {coefficients}")]
    CorrectionLengthMismatch {
        /// Points of the measurement
        measured: usize,
        /// Points the coefficients cover
        coefficients: usize,
    },

    /// Reading or writing a file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File content is not a calibration record
    #[error("Invalid calibration file: {0}")]
    Format(#[from] serde_json::Error),
}

//! One-port short/open/load calibration

use chrono::{DateTime, Utc};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use super::{CalibrationError, DetectorConstants, S11Dataset};

/// Denominators `|g_short - g_open|` below this are treated as singular
pub const SINGULAR_THRESHOLD: f64 = 1e-12;

/// Calibration standard connected during a calibration sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationKind {
    /// Short circuit, ideal reflection -1
    Short,
    /// Open circuit, ideal reflection +1
    Open,
    /// Matched 50 ohm load, ideal reflection 0
    Load,
}

impl CalibrationKind {
    /// Every standard in capture order
    pub const ALL: [CalibrationKind; 3] = [
        CalibrationKind::Short,
        CalibrationKind::Open,
        CalibrationKind::Load,
    ];

    /// Reflection coefficient of the ideal standard
    pub fn ideal_gamma(&self) -> Complex64 {
        match self {
            CalibrationKind::Short => Complex64::new(-1.0, 0.0),
            CalibrationKind::Open => Complex64::new(1.0, 0.0),
            CalibrationKind::Load => Complex64::new(0.0, 0.0),
        }
    }
}

impl fmt::Display for CalibrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationKind::Short => write!(f, "short"),
            CalibrationKind::Open => write!(f, "open"),
            CalibrationKind::Load => write!(f, "load"),
        }
    }
}

/// Per-frequency error terms of the one-port model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorCoefficients {
    /// Frequencies the terms were computed at (Hz)
    pub frequency: Vec<f64>,
    /// Directivity
    pub e_d: Vec<Complex64>,
    /// Source match
    pub e_s: Vec<Complex64>,
    /// Reflection tracking
    pub e_t: Vec<Complex64>,
}

impl ErrorCoefficients {
    /// Number of frequencies covered
    pub fn len(&self) -> usize {
        self.e_d.len()
    }

    /// True when no frequency is covered
    pub fn is_empty(&self) -> bool {
        self.e_d.is_empty()
    }
}

/// Solve the error terms from the three measured standards.
///
/// With measured reflections `g_s`, `g_o`, `g_l`:
///
/// ```text
/// E_D = g_l
/// E_T = (2 g_l - (g_s + g_o)) / (g_s - g_o)
/// E_S = 2 (g_o + g_l)(g_s + g_l) / (g_s - g_o)
/// ```
///
/// Only verified against 50 ohm references; coil loads may need
/// measured rather than ideal standard values.
pub fn compute_error_coefficients(
    short: &S11Dataset,
    open: &S11Dataset,
    load: &S11Dataset,
    detector: &DetectorConstants,
) -> Result<ErrorCoefficients, CalibrationError> {
    if short.len() != open.len() || short.len() != load.len() {
        return Err(CalibrationError::LengthMismatch {
            short: short.len(),
            open: open.len(),
            load: load.len(),
        });
    }

    let g_short = short.gamma(detector);
    let g_open = open.gamma(detector);
    let g_load = load.gamma(detector);
    let frequency = load.frequency();

    let mut coefficients = ErrorCoefficients {
        frequency: frequency.clone(),
        e_d: Vec::with_capacity(load.len()),
        e_s: Vec::with_capacity(load.len()),
        e_t: Vec::with_capacity(load.len()),
    };

    for (i, ((&g_s, &g_o), &g_l)) in g_short.iter().zip(&g_open).zip(&g_load).enumerate() {
        let denominator = g_s - g_o;
        if denominator.norm() < SINGULAR_THRESHOLD {
            return Err(CalibrationError::SingularDenominator {
                index: i,
                frequency_hz: frequency[i],
            });
        }

        coefficients.e_d.push(g_l);
        coefficients.e_t.push((2.0 * g_l - (g_s + g_o)) / denominator);
        coefficients.e_s.push(2.0 * (g_o + g_l) * (g_s + g_l) / denominator);
    }

    Ok(coefficients)
}

/// Remove the systematic error from measured reflection coefficients
pub fn apply_correction(
    measured: &[Complex64],
    coefficients: &ErrorCoefficients,
) -> Result<Vec<Complex64>, CalibrationError> {
    if measured.len() != coefficients.len() {
        return Err(CalibrationError::CorrectionLengthMismatch {
            measured: measured.len(),
            coefficients: coefficients.len(),
        });
    }

    Ok(measured
        .iter()
        .zip(coefficients.e_d.iter().zip(&coefficients.e_s).zip(&coefficients.e_t))
        .map(|(&m, ((&e_d, &e_s), &e_t))| {
            let offset = m - e_d;
            offset / (e_s * offset + e_t)
        })
        .collect())
}

/// The three calibration slots and the terms derived from them
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    short: Option<S11Dataset>,
    open: Option<S11Dataset>,
    load: Option<S11Dataset>,
    coefficients: Option<ErrorCoefficients>,
}

impl CalibrationSet {
    /// All slots empty
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep stored for `kind`
    pub fn get(&self, kind: CalibrationKind) -> Option<&S11Dataset> {
        match kind {
            CalibrationKind::Short => self.short.as_ref(),
            CalibrationKind::Open => self.open.as_ref(),
            CalibrationKind::Load => self.load.as_ref(),
        }
    }

    /// Store a calibration sweep. Previously computed terms become stale.
    pub fn set(&mut self, kind: CalibrationKind, dataset: S11Dataset) {
        let slot = match kind {
            CalibrationKind::Short => &mut self.short,
            CalibrationKind::Open => &mut self.open,
            CalibrationKind::Load => &mut self.load,
        };
        *slot = Some(dataset);
        self.coefficients = None;
    }

    /// Slots that have not been measured yet
    pub fn missing(&self) -> Vec<CalibrationKind> {
        CalibrationKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).is_none())
            .collect()
    }

    /// All three standards are present
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    fn require(&self, kind: CalibrationKind) -> Result<&S11Dataset, CalibrationError> {
        self.get(kind).ok_or(CalibrationError::MissingSlot(kind))
    }

    /// Compute and keep the error terms
    pub fn compute(&mut self, detector: &DetectorConstants) -> Result<&ErrorCoefficients, CalibrationError> {
        let coefficients = compute_error_coefficients(
            self.require(CalibrationKind::Short)?,
            self.require(CalibrationKind::Open)?,
            self.require(CalibrationKind::Load)?,
            detector,
        )?;
        Ok(&*self.coefficients.insert(coefficients))
    }

    /// Terms from the last [`CalibrationSet::compute`], cleared by [`CalibrationSet::set`]
    pub fn coefficients(&self) -> Option<&ErrorCoefficients> {
        self.coefficients.as_ref()
    }

    /// Persisted form; all three slots must be present
    pub fn to_record(&self) -> Result<CalibrationRecord, CalibrationError> {
        Ok(CalibrationRecord {
            created: Some(Utc::now()),
            short: self.require(CalibrationKind::Short)?.clone(),
            open: self.require(CalibrationKind::Open)?.clone(),
            load: self.require(CalibrationKind::Load)?.clone(),
        })
    }

    /// Restore the three slots; the terms have to be recomputed
    pub fn from_record(record: CalibrationRecord) -> Self {
        Self {
            short: Some(record.short),
            open: Some(record.open),
            load: Some(record.load),
            coefficients: None,
        }
    }
}

/// Calibration file contents: one raw-array section per standard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// When the record was written
    pub created: Option<DateTime<Utc>>,
    /// Short standard sweep
    pub short: S11Dataset,
    /// Open standard sweep
    pub open: S11Dataset,
    /// Load standard sweep
    pub load: S11Dataset,
}

impl CalibrationRecord {
    /// Read a calibration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the record as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

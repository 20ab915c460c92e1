//! Voltage lookup table
//!
//! Maps target frequencies (MHz) to the tuning and matching voltages that
//! resonate and match the coil there. The table is created with every
//! frequency unset and is filled one entry at a time while the instrument runs
//! its voltage search; the entry being searched is the "started" frequency.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Tolerance for grid arithmetic on frequencies (MHz)
pub const FREQUENCY_TOLERANCE: f64 = 1e-9;

/// Smallest step the instrument can resolve: frequencies go out in whole hertz (MHz)
pub const MIN_STEP_MHZ: f64 = 1e-6;

/// Upper bound on the number of entries of any table
pub const MAX_ENTRIES: usize = 1_000_000;

/// Errors raised by the lookup table
#[derive(Error, Debug)]
pub enum LutError {
    /// Start, stop or step rejected
    #[error("Invalid LUT range: {0}")]
    InvalidRange(String),

    /// Voltages arrived with no entry awaiting them
    #[error("No frequency has been started")]
    NoStartedFrequency,

    /// Frequency off the table's grid
    #[error("{0} MHz is not a frequency of this table")]
    UnknownFrequency(f64),

    /// Range and step describe an oversized table
    #[error("LUT would hold {requested} entries, the limit is {limit}")]
    TooManyEntries {
        /// Entries the range would need
        requested: f64,
        /// Largest accepted size
        limit: usize,
    },

    /// Reading or writing the file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File content is not a serialized table
    #[error("Invalid LUT file: {0}")]
    Format(#[from] serde_json::Error),
}

/// Voltages found for one frequency; `None` means not yet measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VoltagePoint {
    /// Tuning varactor voltage (V)
    pub tuning_voltage: Option<f64>,
    /// Matching varactor voltage (V)
    pub matching_voltage: Option<f64>,
}

impl VoltagePoint {
    /// Both voltages are known
    pub fn is_set(&self) -> bool {
        self.tuning_voltage.is_some() && self.matching_voltage.is_some()
    }

    /// `(tuning, matching)` when both are known
    pub fn pair(&self) -> Option<(f64, f64)> {
        Some((self.tuning_voltage?, self.matching_voltage?))
    }
}

/// One row of a [`LookupTable`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LutEntry {
    /// Target frequency (MHz)
    pub frequency: f64,
    #[serde(flatten)]
    /// Search result, unset until measured
    pub voltages: VoltagePoint,
}

/// Frequency to voltage table covering `[start, stop)` in `step` increments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    start: f64,
    stop: f64,
    step: f64,
    entries: Vec<LutEntry>,
    /// Index of the entry awaiting its voltages
    #[serde(skip)]
    started: Option<usize>,
}

/// Round onto the 1e-9 MHz grid so accumulated step error never shows up
fn snap(frequency: f64) -> f64 {
    (frequency * 1e9).round() / 1e9
}

impl LookupTable {
    /// Check `0 <= start < stop`, `MIN_STEP_MHZ <= step <= stop - start`
    /// and that the table stays within [`MAX_ENTRIES`]
    pub fn validate_range(start: f64, stop: f64, step: f64) -> Result<(), LutError> {
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(LutError::InvalidRange("values must be finite".to_string()));
        }
        if start < 0.0 {
            return Err(LutError::InvalidRange(format!(
                "start {} MHz is negative",
                start
            )));
        }
        if start >= stop {
            return Err(LutError::InvalidRange(format!(
                "start {} MHz is not below stop {} MHz",
                start, stop
            )));
        }
        if step < MIN_STEP_MHZ {
            return Err(LutError::InvalidRange(format!(
                "step {} MHz is below the 1 Hz resolution of the instrument",
                step
            )));
        }
        if step > (stop - start) + FREQUENCY_TOLERANCE {
            return Err(LutError::InvalidRange(format!(
                "step {} MHz exceeds the range {} MHz",
                step,
                stop - start
            )));
        }
        let count = Self::entry_count(start, stop, step);
        if count > MAX_ENTRIES as f64 {
            return Err(LutError::TooManyEntries {
                requested: count,
                limit: MAX_ENTRIES,
            });
        }
        Ok(())
    }

    /// Number of grid points in `[start, stop)`; stays a float so huge ranges
    /// can be rejected before anything is allocated
    pub fn entry_count(start: f64, stop: f64, step: f64) -> f64 {
        let steps = (stop - start) / step;
        let rounded = steps.round();
        // a millionth of a step is float noise, not a partial step
        if (steps - rounded).abs() < 1e-6 {
            rounded
        } else {
            steps.ceil()
        }
    }

    /// Table covering `[start, stop)` in `step` increments, all unset
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self, LutError> {
        Self::validate_range(start, stop, step)?;
        let count = Self::entry_count(start, stop, step) as usize;

        let entries = (0..count)
            .map(|i| LutEntry {
                frequency: snap(start + i as f64 * step),
                voltages: VoltagePoint::default(),
            })
            .collect();

        Ok(Self {
            start,
            stop,
            step,
            entries,
            started: None,
        })
    }

    /// First frequency of the table (MHz)
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Exclusive upper bound (MHz)
    pub fn stop(&self) -> f64 {
        self.stop
    }

    /// Grid spacing (MHz)
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Entries in ascending frequency order
    pub fn entries(&self) -> &[LutEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True for a table without entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Grid frequencies (MHz)
    pub fn frequencies(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.frequency).collect()
    }

    /// Index of the grid point nearest to `frequency`, if it lies within half a step
    fn position(&self, frequency: f64) -> Option<usize> {
        let index = ((frequency - self.start) / self.step).round();
        if !index.is_finite() || index < 0.0 || index >= self.entries.len() as f64 {
            return None;
        }
        let index = index as usize;
        let offset = (self.entries[index].frequency - frequency).abs();
        (offset <= self.step / 2.0 + FREQUENCY_TOLERANCE).then_some(index)
    }

    /// Make `frequency` the entry that receives the next voltages
    pub fn mark_started(&mut self, frequency: f64) -> Result<(), LutError> {
        let index = self
            .position(frequency)
            .ok_or(LutError::UnknownFrequency(frequency))?;
        self.started = Some(index);
        Ok(())
    }

    /// Move the cursor to the first unset entry and return its frequency
    pub fn start_next(&mut self) -> Option<f64> {
        let index = self.entries.iter().position(|e| !e.voltages.is_set())?;
        self.started = Some(index);
        Some(self.entries[index].frequency)
    }

    /// Frequency currently awaiting its result
    pub fn started_frequency(&self) -> Option<f64> {
        self.started.map(|i| self.entries[i].frequency)
    }

    /// Store the search result for the started frequency
    pub fn add_voltages(&mut self, matching: f64, tuning: f64) -> Result<(), LutError> {
        let index = self.started.ok_or(LutError::NoStartedFrequency)?;
        self.entries[index].voltages = VoltagePoint {
            tuning_voltage: Some(tuning),
            matching_voltage: Some(matching),
        };
        Ok(())
    }

    /// Some entry still lacks its voltages
    pub fn is_incomplete(&self) -> bool {
        self.entries.iter().any(|e| !e.voltages.is_set())
    }

    /// First frequency (ascending) with a missing voltage
    pub fn next_unset_frequency(&self) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| !e.voltages.is_set())
            .map(|e| e.frequency)
    }

    /// Entry closest to `target`; on a tie the lower frequency wins
    pub fn nearest_entry(&self, target: f64) -> Option<&LutEntry> {
        let mut best: Option<&LutEntry> = None;
        for entry in &self.entries {
            let closer = match best {
                None => true,
                Some(b) => (entry.frequency - target).abs() < (b.frequency - target).abs(),
            };
            if closer {
                best = Some(entry);
            }
        }
        best
    }

    /// `(tuning, matching)` of the nearest entry, if it has been measured
    pub fn lookup(&self, target: f64) -> Option<(f64, f64)> {
        self.nearest_entry(target)?.voltages.pair()
    }

    /// Write the table as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LutError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Read a table written by [`LookupTable::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LutError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

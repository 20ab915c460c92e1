//! Raw reflection samples and datasets

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::CalibrationError;

/// Transfer constants of the gain/phase detector on the ATM board.
///
/// The detector outputs a voltage proportional to the magnitude ratio (in dB)
/// and one proportional to the phase difference (in degrees), both offset by a
/// center voltage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConstants {
    /// Magnitude output at 0 dB (mV)
    pub center_magnitude_mv: f64,
    /// Magnitude output slope (mV per dB)
    pub magnitude_slope_mv_per_db: f64,
    /// Phase output at 0 degrees (mV)
    pub center_phase_mv: f64,
    /// Phase output slope (mV per degree)
    pub phase_slope_mv_per_deg: f64,
}

impl Default for DetectorConstants {
    fn default() -> Self {
        Self {
            center_magnitude_mv: 900.0,
            magnitude_slope_mv_per_db: 30.0,
            center_phase_mv: 1800.0,
            phase_slope_mv_per_deg: 10.0,
        }
    }
}

impl DetectorConstants {
    /// Convert a magnitude reading to return loss in dB
    pub fn return_loss_db(&self, raw_mv: f64) -> f64 {
        (raw_mv - self.center_magnitude_mv) / self.magnitude_slope_mv_per_db
    }

    /// Convert a phase reading to degrees
    pub fn phase_deg(&self, raw_mv: f64) -> f64 {
        (raw_mv - self.center_phase_mv) / self.phase_slope_mv_per_deg
    }

    /// Reflection coefficient for one raw reading pair
    pub fn gamma(&self, return_loss_raw_mv: f64, phase_raw_mv: f64) -> Complex64 {
        let magnitude = 10f64.powf(-self.return_loss_db(return_loss_raw_mv) / 20.0);
        Complex64::from_polar(magnitude, self.phase_deg(phase_raw_mv).to_radians())
    }
}

/// One measurement point as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Sweep frequency (Hz)
    pub frequency_hz: f64,
    /// Magnitude detector output (mV)
    pub return_loss_raw_mv: f64,
    /// Phase detector output (mV)
    pub phase_raw_mv: f64,
}

impl RawSample {
    /// Sample from the three values of an `f` line
    pub fn new(frequency_hz: f64, return_loss_raw_mv: f64, phase_raw_mv: f64) -> Self {
        Self {
            frequency_hz,
            return_loss_raw_mv,
            phase_raw_mv,
        }
    }

    /// Return loss (dB)
    pub fn return_loss_db(&self, detector: &DetectorConstants) -> f64 {
        detector.return_loss_db(self.return_loss_raw_mv)
    }

    /// Reflection phase (degrees)
    pub fn phase_deg(&self, detector: &DetectorConstants) -> f64 {
        detector.phase_deg(self.phase_raw_mv)
    }

    /// Complex reflection coefficient
    pub fn gamma(&self, detector: &DetectorConstants) -> Complex64 {
        detector.gamma(self.return_loss_raw_mv, self.phase_raw_mv)
    }
}

/// Persisted form of a dataset: three parallel raw arrays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Frequencies (Hz)
    pub frequency: Vec<f64>,
    /// Raw magnitude readings (mV)
    pub return_loss_mv: Vec<f64>,
    /// Raw phase readings (mV)
    pub phase_mv: Vec<f64>,
}

/// An S11 sweep: samples in the order the device reported them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DatasetRecord", into = "DatasetRecord")]
pub struct S11Dataset {
    samples: Vec<RawSample>,
}

impl S11Dataset {
    /// Dataset over `samples` as received
    pub fn new(samples: Vec<RawSample>) -> Self {
        Self { samples }
    }

    /// Samples in arrival order
    pub fn samples(&self) -> &[RawSample] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for a sweep without samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frequencies in Hz
    pub fn frequency(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.frequency_hz).collect()
    }

    /// Raw magnitude readings in mV
    pub fn return_loss_mv(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.return_loss_raw_mv).collect()
    }

    /// Raw phase readings in mV
    pub fn phase_mv(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.phase_raw_mv).collect()
    }

    /// Return loss per sample (dB)
    pub fn return_loss_db(&self, detector: &DetectorConstants) -> Vec<f64> {
        self.samples.iter().map(|s| s.return_loss_db(detector)).collect()
    }

    /// Phase per sample (degrees)
    pub fn phase_deg(&self, detector: &DetectorConstants) -> Vec<f64> {
        self.samples.iter().map(|s| s.phase_deg(detector)).collect()
    }

    /// Complex reflection coefficient per sample
    pub fn gamma(&self, detector: &DetectorConstants) -> Vec<Complex64> {
        self.samples.iter().map(|s| s.gamma(detector)).collect()
    }

    /// Frequency and return loss of the best-matched point (highest return loss)
    pub fn best_match(&self, detector: &DetectorConstants) -> Option<(f64, f64)> {
        self.samples
            .iter()
            .map(|s| (s.frequency_hz, s.return_loss_db(detector)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Raw arrays for persistence
    pub fn to_record(&self) -> DatasetRecord {
        DatasetRecord {
            frequency: self.frequency(),
            return_loss_mv: self.return_loss_mv(),
            phase_mv: self.phase_mv(),
        }
    }

    /// Rebuild a dataset from its three arrays; they must have equal length
    pub fn from_record(record: DatasetRecord) -> Result<Self, CalibrationError> {
        let DatasetRecord {
            frequency,
            return_loss_mv,
            phase_mv,
        } = record;

        if frequency.len() != return_loss_mv.len() || frequency.len() != phase_mv.len() {
            return Err(CalibrationError::RecordLengthMismatch {
                frequency: frequency.len(),
                return_loss: return_loss_mv.len(),
                phase: phase_mv.len(),
            });
        }

        let samples = frequency
            .into_iter()
            .zip(return_loss_mv)
            .zip(phase_mv)
            .map(|((f, rl), ph)| RawSample::new(f, rl, ph))
            .collect();
        Ok(Self { samples })
    }
}

impl From<S11Dataset> for DatasetRecord {
    fn from(dataset: S11Dataset) -> Self {
        dataset.to_record()
    }
}

impl TryFrom<DatasetRecord> for S11Dataset {
    type Error = CalibrationError;

    fn try_from(record: DatasetRecord) -> Result<Self, Self::Error> {
        S11Dataset::from_record(record)
    }
}

impl FromIterator<RawSample> for S11Dataset {
    fn from_iter<I: IntoIterator<Item = RawSample>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> S11Dataset {
        S11Dataset::new(vec![
            RawSample::new(80e6, 900.0, 1800.0),
            RawSample::new(81e6, 1500.0, 900.0),
            RawSample::new(82e6, 1200.0, 2700.0),
        ])
    }

    #[test]
    fn test_center_values_map_to_zero() {
        let detector = DetectorConstants::default();
        let sample = RawSample::new(1_000_000.0, 900.0, 1800.0);
        assert_eq!(sample.return_loss_db(&detector), 0.0);
        assert_eq!(sample.phase_deg(&detector), 0.0);

        let gamma = sample.gamma(&detector);
        assert!((gamma.re - 1.0).abs() < 1e-12);
        assert!(gamma.im.abs() < 1e-12);
    }

    #[test]
    fn test_views_have_sample_length() {
        let detector = DetectorConstants::default();
        let d = dataset();
        assert_eq!(d.frequency().len(), 3);
        assert_eq!(d.return_loss_db(&detector).len(), 3);
        assert_eq!(d.phase_deg(&detector).len(), 3);
        assert_eq!(d.gamma(&detector).len(), 3);
    }

    #[test]
    fn test_derived_values() {
        let detector = DetectorConstants::default();
        let d = dataset();
        assert_eq!(d.return_loss_db(&detector), vec![0.0, 20.0, 10.0]);
        assert_eq!(d.phase_deg(&detector), vec![0.0, -90.0, 90.0]);

        // 20 dB return loss -> |gamma| = 0.1 at -90 degrees
        let g = d.gamma(&detector)[1];
        assert!((g.norm() - 0.1).abs() < 1e-12);
        assert!(g.re.abs() < 1e-12);
        assert!((g.im + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_best_match() {
        let detector = DetectorConstants::default();
        assert_eq!(dataset().best_match(&detector), Some((81e6, 20.0)));
        assert_eq!(S11Dataset::default().best_match(&detector), None);
    }

    #[test]
    fn test_record_round_trip_is_exact() {
        let d = S11Dataset::new(vec![
            RawSample::new(83_560_000.123_456_7, 0.1 + 0.2, 1.0 / 3.0),
            RawSample::new(f64::MIN_POSITIVE, 1e300, -0.0),
        ]);
        let back = S11Dataset::from_record(d.to_record()).unwrap();
        for (a, b) in d.samples().iter().zip(back.samples()) {
            assert_eq!(a.frequency_hz.to_bits(), b.frequency_hz.to_bits());
            assert_eq!(a.return_loss_raw_mv.to_bits(), b.return_loss_raw_mv.to_bits());
            assert_eq!(a.phase_raw_mv.to_bits(), b.phase_raw_mv.to_bits());
        }
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let d = S11Dataset::new(vec![RawSample::new(
            35_123_456.789,
            0.1 + 0.2,
            std::f64::consts::PI * 100.0,
        )]);
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"return_loss_mv\""));
        let back: S11Dataset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_record_with_unequal_arrays_is_rejected() {
        let record = DatasetRecord {
            frequency: vec![1.0, 2.0],
            return_loss_mv: vec![900.0],
            phase_mv: vec![1800.0, 1800.0],
        };
        assert!(matches!(
            S11Dataset::from_record(record),
            Err(CalibrationError::RecordLengthMismatch {
                frequency: 2,
                return_loss: 1,
                phase: 2
            })
        ));
    }
}

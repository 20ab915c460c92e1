//! Line codec
//!
//! Classifies lines received from the ATM instrument by their first
//! character. Every line maps either to a [`DeviceLine`] or to
//! [`ProtocolError::MalformedLine`]; nothing is dropped silently.

use super::ProtocolError;
use crate::model::RawSample;

/// Single-byte token the firmware answers every accepted command with
pub const CONFIRMATION_TOKEN: &str = "c";

/// A classified line from the device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLine {
    /// `f<freq>r<return_loss>p<phase>`
    DataPoint(RawSample),
    /// `r` - end of the sweep batch
    SweepComplete,
    /// `v<matching>t<tuning>` - result of one voltage-sweep step
    VoltageResult {
        /// Matching varactor voltage (V)
        matching: f64,
        /// Tuning varactor voltage (V)
        tuning: f64,
    },
    /// `i<text>`
    Info(String),
    /// `e<text>`
    DeviceError(String),
    /// `c`
    Confirmation,
}

/// Strip the line terminator the firmware appends
pub fn trim_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Parse one line received from the device
pub fn parse_line(raw: &str) -> Result<DeviceLine, ProtocolError> {
    let line = trim_line_ending(raw);
    let mut chars = line.chars();
    let prefix = chars
        .next()
        .ok_or_else(|| malformed(line, "empty line"))?;
    let payload = chars.as_str();

    match prefix {
        'f' => parse_data_point(line, payload).map(DeviceLine::DataPoint),
        'r' => expect_empty(line, payload).map(|_| DeviceLine::SweepComplete),
        'v' => parse_voltage_result(line, payload),
        'i' => Ok(DeviceLine::Info(payload.to_string())),
        'e' => Ok(DeviceLine::DeviceError(payload.to_string())),
        'c' => expect_empty(line, payload).map(|_| DeviceLine::Confirmation),
        other => Err(malformed(line, format!("unknown prefix '{}'", other))),
    }
}

fn parse_data_point(line: &str, payload: &str) -> Result<RawSample, ProtocolError> {
    let (frequency, rest) = payload
        .split_once('r')
        .ok_or_else(|| malformed(line, "missing 'r' separator"))?;
    let (return_loss, phase) = rest
        .split_once('p')
        .ok_or_else(|| malformed(line, "missing 'p' separator"))?;

    Ok(RawSample::new(
        parse_number(line, "frequency", frequency)?,
        parse_number(line, "return loss", return_loss)?,
        parse_number(line, "phase", phase)?,
    ))
}

fn parse_voltage_result(line: &str, payload: &str) -> Result<DeviceLine, ProtocolError> {
    let (matching, tuning) = payload
        .split_once('t')
        .ok_or_else(|| malformed(line, "missing 't' separator"))?;

    Ok(DeviceLine::VoltageResult {
        matching: parse_number(line, "matching voltage", matching)?,
        tuning: parse_number(line, "tuning voltage", tuning)?,
    })
}

fn parse_number(line: &str, field: &str, text: &str) -> Result<f64, ProtocolError> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| malformed(line, format!("invalid {} '{}'", field, text)))?;
    if !value.is_finite() {
        return Err(malformed(line, format!("non-finite {} '{}'", field, text)));
    }
    Ok(value)
}

fn expect_empty(line: &str, payload: &str) -> Result<(), ProtocolError> {
    if payload.trim().is_empty() {
        Ok(())
    } else {
        Err(malformed(line, format!("unexpected payload '{}'", payload)))
    }
}

fn malformed(line: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedLine {
        line: line.to_string(),
        reason: reason.into(),
    }
}

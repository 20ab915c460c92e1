//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the ATM instrument
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The OS reported a port failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// The command was not confirmed in time
    #[error("No confirmation from device within {waited_ms}ms")]
    Timeout {
        /// How long the driver waited
        waited_ms: u64,
    },

    /// No transport attached
    #[error("Not connected to ATM device")]
    NotConnected,

    /// The transport was open and is now closed
    #[error("Connection to ATM device closed")]
    ConnectionClosed,

    /// `connect` while a port is open
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// A line other than the confirmation answered a command
    #[error("Unexpected response from device: '{0}'")]
    UnexpectedResponse(String),

    /// A received line could not be decoded
    #[error("Malformed line '{line}': {reason}")]
    MalformedLine {
        /// Offending line, shortened when overlong
        line: String,
        /// What is wrong with it
        reason: String,
    },

    /// No such port
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for failures that mean the link itself is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected
                | ProtocolError::ConnectionClosed
                | ProtocolError::SerialError(_)
        )
    }
}

//! Serial Protocol Communication
//!
//! Implements the line-oriented ASCII protocol of the ATM instrument:
//! command frames out, prefixed lines in, one confirmed command at a time.

pub mod codec;
pub mod commands;
mod driver;
mod error;
pub mod serial;
pub mod transport;

pub use codec::{parse_line, DeviceLine, CONFIRMATION_TOKEN};
pub use commands::{DeviceCommand, RfPath};
pub use driver::CommandDriver;
pub use error::ProtocolError;
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use transport::{available_lines, LineBuffer, LineTransport, SerialTransport, MAX_LINE_BYTES};

/// Baud rate of the ATM board firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default time to wait for a command confirmation in milliseconds.
/// Homing and relay switching on the board take several seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Interval between transport polls while waiting for a confirmation
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2;

//! Line-oriented transports
//!
//! The ATM firmware speaks newline-delimited ASCII. A [`LineTransport`] hands
//! out complete lines only; bytes of a partially received line stay buffered
//! until the terminator arrives.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use tracing::{debug, trace};

use super::ProtocolError;

/// Abstraction over the link to the instrument (serial port or simulator)
pub trait LineTransport: Send {
    /// Write a complete command frame
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Return the next complete line if one is available, without blocking
    fn poll_line(&mut self) -> Result<Option<String>, ProtocolError>;

    /// Whether the underlying link is still usable
    fn is_open(&self) -> bool;

    /// Human readable endpoint name (port path)
    fn name(&self) -> &str;
}

/// Lazy iterator over the lines currently available on a transport.
///
/// Stops at the first poll that yields nothing; errors are yielded once and
/// end the iteration.
pub struct AvailableLines<'a> {
    transport: &'a mut dyn LineTransport,
    done: bool,
}

impl Iterator for AvailableLines<'_> {
    type Item = Result<String, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.transport.poll_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterate over every line that has already arrived
pub fn available_lines(transport: &mut dyn LineTransport) -> AvailableLines<'_> {
    AvailableLines {
        transport,
        done: false,
    }
}

/// Longest line the firmware sends is well under this (bytes)
pub const MAX_LINE_BYTES: usize = 4096;

/// Accumulates raw bytes and splits them into lines.
///
/// Accepts `\n`, `\r\n` and bare `\r` terminators. Invalid UTF-8 is replaced
/// rather than rejected so the codec can report the line as malformed. A line
/// growing past [`MAX_LINE_BYTES`] is dropped and queued as a
/// [`ProtocolError::MalformedLine`]; reception resumes after its terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Skipping the rest of an overlong line
    discarding: bool,
    lines: VecDeque<Result<String, ProtocolError>>,
}

impl LineBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        for &byte in data {
            match byte {
                b'\n' | b'\r' => {
                    if self.discarding {
                        self.discarding = false;
                    } else if !self.pending.is_empty() {
                        // "\r\n" yields one line; the empty segment is skipped
                        let line = String::from_utf8_lossy(&self.pending).into_owned();
                        self.pending.clear();
                        self.lines.push_back(Ok(line));
                    }
                }
                _ if self.discarding => {}
                _ if self.pending.len() >= MAX_LINE_BYTES => {
                    let head = String::from_utf8_lossy(&self.pending[..16]).into_owned();
                    self.pending.clear();
                    self.discarding = true;
                    self.lines.push_back(Err(ProtocolError::MalformedLine {
                        line: format!("{}...", head),
                        reason: format!("no line terminator within {} bytes", MAX_LINE_BYTES),
                    }));
                }
                _ => self.pending.push(byte),
            }
        }
    }

    /// Pop the oldest complete line, or the error that replaced it
    pub fn pop_line(&mut self) -> Option<Result<String, ProtocolError>> {
        self.lines.pop_front()
    }

    /// Bytes of the line still being received
    pub fn partial_len(&self) -> usize {
        self.pending.len()
    }
}

/// Serial port transport for the ATM board
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    buffer: LineBuffer,
    open: bool,
}

impl SerialTransport {
    /// Wrap an opened and configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let name = port.name().unwrap_or_else(|| "serial".to_string());
        Self {
            port,
            name,
            buffer: LineBuffer::new(),
            open: true,
        }
    }

    /// Read whatever the driver has buffered into the line buffer
    fn fill(&mut self) -> Result<(), ProtocolError> {
        let available = self.port.bytes_to_read().map_err(|e| {
            self.open = false;
            ProtocolError::SerialError(e.to_string())
        })?;
        if available == 0 {
            return Ok(());
        }

        let mut chunk = [0u8; 512];
        let to_read = std::cmp::min(available as usize, chunk.len());
        match self.port.read(&mut chunk[..to_read]) {
            Ok(0) => {
                debug!("serial read returned 0 bytes, treating {} as closed", self.name);
                self.open = false;
                Err(ProtocolError::ConnectionClosed)
            }
            Ok(n) => {
                trace!("read {} bytes: {:?}", n, String::from_utf8_lossy(&chunk[..n]));
                self.buffer.extend(&chunk[..n]);
                Ok(())
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(e) => {
                self.open = false;
                Err(ProtocolError::SerialError(e.to_string()))
            }
        }
    }
}

impl LineTransport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if !self.open {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.port.write_all(data).map_err(|e| {
            self.open = false;
            ProtocolError::SerialError(e.to_string())
        })?;
        self.port
            .flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }

    fn poll_line(&mut self) -> Result<Option<String>, ProtocolError> {
        if let Some(line) = self.buffer.pop_line() {
            return line.map(Some);
        }
        if !self.open {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.fill()?;
        self.buffer.pop_line().transpose()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn name(&self) -> &str {
        &self.name
    }
}

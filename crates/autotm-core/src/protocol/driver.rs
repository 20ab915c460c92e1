//! Command/response driver
//!
//! Sends one command at a time and waits for the single-line confirmation.
//! The transport sits behind a mutex, so concurrent callers are queued and a
//! second command is never written before the first one resolved.

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    codec::{trim_line_ending, CONFIRMATION_TOKEN},
    transport::{available_lines, LineTransport},
    DeviceCommand, ProtocolError,
};
use crate::config::ConnectionConfig;

/// Owns the transport handle and serializes access to it
pub struct CommandDriver {
    transport: Mutex<Option<Box<dyn LineTransport>>>,
    timeout: Duration,
    poll_interval: Duration,
}

impl CommandDriver {
    /// Create a driver without a transport
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            transport: Mutex::new(None),
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn LineTransport>>> {
        // A panic while holding the lock leaves the transport itself intact
        self.transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a transport, returning the previous one
    pub fn attach(&self, transport: Box<dyn LineTransport>) -> Option<Box<dyn LineTransport>> {
        debug!("attaching transport {}", transport.name());
        self.lock().replace(transport)
    }

    /// Remove the transport, returning it
    pub fn detach(&self) -> Option<Box<dyn LineTransport>> {
        self.lock().take()
    }

    /// True when a transport is attached and open
    pub fn is_connected(&self) -> bool {
        self.lock().as_ref().is_some_and(|t| t.is_open())
    }

    /// Name of the attached endpoint
    pub fn endpoint_name(&self) -> Option<String> {
        self.lock().as_ref().map(|t| t.name().to_string())
    }

    /// Send a typed command
    pub fn send(&self, command: &DeviceCommand) -> Result<(), ProtocolError> {
        self.send_line(&command.to_wire())
    }

    /// Send a raw command frame and wait for the device to confirm it.
    ///
    /// Fails with [`ProtocolError::NotConnected`] before writing anything if no
    /// open transport is attached.
    pub fn send_line(&self, command: &str) -> Result<(), ProtocolError> {
        let mut guard = self.lock();
        let transport = guard
            .as_mut()
            .filter(|t| t.is_open())
            .ok_or(ProtocolError::NotConnected)?;

        debug!("-> {}", command);
        transport.write_all(command.as_bytes())?;
        self.await_confirmation(&mut **transport, command)
    }

    fn await_confirmation(
        &self,
        transport: &mut dyn LineTransport,
        command: &str,
    ) -> Result<(), ProtocolError> {
        let start = Instant::now();
        loop {
            if let Some(line) = transport.poll_line()? {
                let line = trim_line_ending(&line);
                if line == CONFIRMATION_TOKEN {
                    debug!(
                        "<- confirmation for '{}' after {}ms",
                        command,
                        start.elapsed().as_millis()
                    );
                    return Ok(());
                }
                warn!("'{}' answered with '{}' instead of confirmation", command, line);
                return Err(ProtocolError::UnexpectedResponse(line.to_string()));
            }

            if !transport.is_open() {
                warn!("transport closed while waiting for confirmation of '{}'", command);
                return Err(ProtocolError::ConnectionClosed);
            }

            if start.elapsed() >= self.timeout {
                warn!(
                    "no confirmation for '{}' within {}ms",
                    command,
                    self.timeout.as_millis()
                );
                return Err(ProtocolError::Timeout {
                    waited_ms: self.timeout.as_millis() as u64,
                });
            }

            thread::sleep(self.poll_interval);
        }
    }

    /// Drain every complete line that has arrived.
    ///
    /// Lines received before an error are returned together with it so the
    /// caller can still process them.
    pub fn read_available_lines(&self) -> (Vec<String>, Option<ProtocolError>) {
        let mut guard = self.lock();
        let Some(transport) = guard.as_mut() else {
            return (Vec::new(), Some(ProtocolError::NotConnected));
        };

        let mut lines = Vec::new();
        for item in available_lines(&mut **transport) {
            match item {
                Ok(line) => lines.push(line),
                Err(e) => return (lines, Some(e)),
            }
        }

        if !transport.is_open() {
            return (lines, Some(ProtocolError::ConnectionClosed));
        }
        (lines, None)
    }
}

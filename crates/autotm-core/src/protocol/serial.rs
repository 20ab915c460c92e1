//! Serial port handling
//!
//! Port discovery and opening for the ATM board (an Arduino-class
//! microcontroller behind a USB CDC or USB-UART bridge).

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// USB vendor IDs of the bridges found on ATM boards
const KNOWN_BRIDGE_VIDS: [u16; 4] = [
    0x2341, // Arduino
    0x1A86, // WCH CH340
    0x0403, // FTDI
    0x10C4, // Silicon Labs CP210x
];

/// A serial port that may have an ATM board attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port path, e.g. "/dev/ttyACM0" or "COM3"
    pub name: String,
    /// USB vendor ID
    pub vid: Option<u16>,
    /// USB product ID
    pub pid: Option<u16>,
    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }

    /// True when the USB bridge is one commonly used on ATM boards
    pub fn is_known_bridge(&self) -> bool {
        self.vid.is_some_and(|vid| KNOWN_BRIDGE_VIDS.contains(&vid))
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let mut port = Self::bare(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.product = usb.product;
        }
        port
    }
}

/// Ordering: ttyACM*, then ttyUSB* (numeric suffix), then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name).to_string();
    let family = [("ttyACM", 0u8), ("ttyUSB", 1u8)]
        .into_iter()
        .find_map(|(prefix, rank)| {
            basename
                .strip_prefix(prefix)
                .map(|suffix| (rank, suffix.parse::<usize>().unwrap_or(usize::MAX)))
        });
    match family {
        Some((rank, index)) => (rank, index, basename),
        None => (2, 0, basename),
    }
}

/// Sort ports in [`list_ports`] order
pub fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by_key(|p| port_sort_key(&p.name));
}

/// Enumerate serial ports in a stable order
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: BTreeMap<String, PortInfo> = BTreeMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for port in ports.into_iter().map(PortInfo::from) {
                found.entry(port.name.clone()).or_insert(port);
            }
        }
        Err(e) => warn!("serial port enumeration failed: {}", e),
    }

    // udev-less systems do not report CDC devices
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        let names = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("ttyACM") || name.starts_with("ttyUSB"));
        for name in names {
            let path = format!("/dev/{}", name);
            found
                .entry(path.clone())
                .or_insert_with(|| PortInfo::bare(path));
        }
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    sort_ports(&mut ports);
    debug!(
        "found {} serial ports ({} with a known bridge)",
        ports.len(),
        ports.iter().filter(|p| p.is_known_bridge()).count()
    );
    ports
}

fn port_error(e: serialport::Error) -> ProtocolError {
    ProtocolError::SerialError(e.to_string())
}

/// Open the port of an ATM board. Reads use a short timeout; callers poll
/// `bytes_to_read()` instead of blocking.
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    debug!("opening {} at {} baud", name, baud);

    serialport::new(name, baud)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => port_error(e),
        })
}

/// 8N1, no flow control, DTR asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(DataBits::Eight).map_err(port_error)?;
    port.set_parity(Parity::None).map_err(port_error)?;
    port.set_stop_bits(StopBits::One).map_err(port_error)?;
    port.set_flow_control(FlowControl::None).map_err(port_error)?;

    // Dropping DTR resets the board into its bootloader
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("could not assert DTR: {}", e);
    }
    Ok(())
}

/// Discard anything left in the OS buffers from a previous session
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(ClearBuffer::All).map_err(port_error)
}

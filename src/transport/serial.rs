//! USB dongle link.
//!
//! The dongle forwards probe frames over a 4 Mbaud UART. Each frame is announced by an
//! ASCII line ending in `START\n`, followed by a fixed-size binary blob. Everything runs
//! as plain blocking I/O on the worker thread, bounded by the port timeout.

use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::codec::{decode_dongle, AcquisitionFrame, DONGLE_FRAME_LEN};
use crate::config::ConnectionConfig;
use crate::device::DeviceDescriptor;
use crate::errors::{DriverError, Result};
use crate::transport::Transport;

/// Line terminator announcing a frame blob.
pub const START_MARKER: &[u8] = b"START\n";

/// A partial line longer than this is noise, not a marker in progress.
const MAX_PENDING_LINE: usize = 4096;

pub struct SerialTransport {
    baud_rate: u32,
    timeout: Duration,
    port: Option<BufReader<Box<dyn SerialPort>>>,
    /// Bytes of a line cut off by a read timeout, completed by the next read.
    pending_line: Vec<u8>,
}

impl SerialTransport {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            baud_rate: config.serial_baud_rate,
            timeout: config.serial_timeout,
            port: None,
            pending_line: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port_mut(&mut self) -> Result<&mut BufReader<Box<dyn SerialPort>>> {
        self.port
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("serial port is not open".into()))
    }
}

impl Transport for SerialTransport {
    async fn discover(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let ports = serialport::available_ports()?;
        let mut devices: Vec<DeviceDescriptor> = ports
            .iter()
            .filter_map(DeviceDescriptor::from_serial_port)
            .collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        debug!(
            "serial discovery: {} ports, {} usb devices",
            ports.len(),
            devices.len()
        );
        Ok(devices)
    }

    async fn open(&mut self, device: &DeviceDescriptor) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let path = device.serial_port().ok_or_else(|| {
            DriverError::Unsupported(format!("{} is not a serial device", device.name()))
        })?;

        let port = serialport::new(path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;

        info!("serial port opened: port={}, baud={}", path, self.baud_rate);
        self.pending_line.clear();
        self.port = Some(BufReader::new(port));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending_line.clear();
        if let Some(reader) = self.port.take() {
            let name = reader.get_ref().name().unwrap_or_default();
            drop(reader);
            info!("serial port closed: port={}", name);
        }
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.pending_line.clear();
        let reader = self.port_mut()?;

        // Stale bytes from a previous acquisition must not leak into the next one,
        // including whatever the host-side buffer already pulled in.
        let stale = reader.buffer().len();
        reader.consume(stale);
        reader.get_ref().clear(ClearBuffer::All)?;

        let port = reader.get_mut();
        port.write_all(payload)?;
        port.flush()?;
        debug!("config sent: {} bytes ({} stale bytes dropped)", payload.len(), stale);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<AcquisitionFrame>> {
        let reader = self
            .port
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("serial port is not open".into()))?;
        read_frame(reader, &mut self.pending_line)
    }
}

/// Read one `START\n`-announced frame.
///
/// `pending` carries the start of a line across calls: a read that times out halfway
/// through a line keeps those bytes so the next call can finish the line.
///
/// Returns `Ok(None)` when no full line arrived, when the line lacks the marker, when the
/// blob is cut short, and when the blob does not decode.
pub fn read_frame<R: BufRead>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> Result<Option<AcquisitionFrame>> {
    match reader.read_until(b'\n', pending) {
        Ok(_) if pending.ends_with(b"\n") => {}
        Ok(_) => {
            // EOF without a newline; keep the bytes for when the stream resumes.
            trim_pending(pending);
            return Ok(None);
        }
        Err(e) if is_timeout(&e) => {
            debug!("no frame announced before timeout ({} bytes pending)", pending.len());
            trim_pending(pending);
            return Ok(None);
        }
        Err(e) => {
            pending.clear();
            return Err(e.into());
        }
    }

    let line = std::mem::take(pending);
    if !line.ends_with(START_MARKER) {
        debug!("discarding {}-byte line without start marker", line.len());
        return Ok(None);
    }

    let mut blob = vec![0u8; DONGLE_FRAME_LEN];
    match reader.read_exact(&mut blob) {
        Ok(()) => {}
        Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::UnexpectedEof => {
            warn!("frame blob cut short: {}", e);
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    match decode_dongle(&blob) {
        Ok(frame) => Ok(Some(frame)),
        Err(e) => {
            debug!("dropping malformed dongle frame: {}", e);
            Ok(None)
        }
    }
}

fn trim_pending(pending: &mut Vec<u8>) {
    if pending.len() > MAX_PENDING_LINE {
        debug!("discarding {} bytes without a line break", pending.len());
        pending.clear();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

//! Physical links to the probe.
//!
//! A [`Transport`] is owned by the connection worker and only ever driven from its
//! thread, one call at a time. Futures returned by these methods do not need to be
//! `Send`; the worker polls them on a current-thread runtime.

#![allow(async_fn_in_trait)]

use std::fmt;
use std::str::FromStr;

use crate::codec::AcquisitionFrame;
use crate::device::DeviceDescriptor;
use crate::errors::{DriverError, Result};

#[cfg(feature = "ble")]
pub mod ble;
pub mod pipe;
pub mod serial;

#[cfg(feature = "ble")]
pub use ble::BleTransport;
pub use pipe::NotificationPipe;
pub use serial::SerialTransport;

/// Which backend a connection drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// USB serial dongle.
    Dongle,
    /// BLE straight to the probe.
    Direct,
}

impl FromStr for TransportKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dongle" | "serial" => Ok(TransportKind::Dongle),
            "direct" | "ble" => Ok(TransportKind::Direct),
            other => Err(DriverError::Unsupported(format!(
                "unknown connection type {other:?} (expected \"dongle\" or \"direct\")"
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Dongle => f.write_str("dongle"),
            TransportKind::Direct => f.write_str("direct"),
        }
    }
}

/// Backend operations the connection worker drives.
pub trait Transport: Send + 'static {
    /// Enumerate reachable devices.
    async fn discover(&mut self) -> Result<Vec<DeviceDescriptor>>;

    /// Establish the link. On failure the transport is left closed.
    async fn open(&mut self, device: &DeviceDescriptor) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Write a configuration package, discarding any partially received frame first.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Wait for the next frame. `Ok(None)` means a frame arrived but was malformed,
    /// or the link produced nothing usable this time; the caller may retry.
    async fn receive(&mut self) -> Result<Option<AcquisitionFrame>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_both_spellings() {
        assert_eq!("dongle".parse::<TransportKind>().unwrap(), TransportKind::Dongle);
        assert_eq!("SERIAL".parse::<TransportKind>().unwrap(), TransportKind::Dongle);
        assert_eq!("direct".parse::<TransportKind>().unwrap(), TransportKind::Direct);
        assert_eq!("ble".parse::<TransportKind>().unwrap(), TransportKind::Direct);
        assert!("usb".parse::<TransportKind>().is_err());
    }
}

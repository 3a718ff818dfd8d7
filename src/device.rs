//! Transport-agnostic identification of a discoverable probe.

use std::fmt;
use std::path::Path;

#[cfg(feature = "ble")]
use bluer::Address;
use serialport::{SerialPortInfo, SerialPortType};

/// Transport-specific identity of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceHandle {
    /// USB serial dongle.
    Serial {
        port: String,
        vid: u16,
        pid: u16,
        description: Option<String>,
    },
    /// BLE peripheral advertising the probe service.
    #[cfg(feature = "ble")]
    Ble { address: Address },
}

/// A device returned by discovery and accepted by `open`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    name: String,
    handle: DeviceHandle,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, handle: DeviceHandle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Build a descriptor for a serial port. Only USB ports (ports with a vendor id)
    /// qualify; anything else is not a dongle.
    pub fn from_serial_port(info: &SerialPortInfo) -> Option<Self> {
        let SerialPortType::UsbPort(usb) = &info.port_type else {
            return None;
        };
        let name = Path::new(&info.port_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| info.port_name.clone());

        Some(Self::new(
            name,
            DeviceHandle::Serial {
                port: info.port_name.clone(),
                vid: usb.vid,
                pid: usb.pid,
                description: usb.product.clone(),
            },
        ))
    }

    #[cfg(feature = "ble")]
    pub fn from_ble(name: Option<String>, address: Address) -> Self {
        let name = name.unwrap_or_else(|| address.to_string());
        Self::new(name, DeviceHandle::Ble { address })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// OS path of the serial port, if this is a dongle.
    pub fn serial_port(&self) -> Option<&str> {
        match &self.handle {
            DeviceHandle::Serial { port, .. } => Some(port),
            #[cfg(feature = "ble")]
            DeviceHandle::Ble { .. } => None,
        }
    }

    #[cfg(feature = "ble")]
    pub fn ble_address(&self) -> Option<Address> {
        match &self.handle {
            DeviceHandle::Ble { address } => Some(*address),
            DeviceHandle::Serial { .. } => None,
        }
    }

    /// Human readable description for device pickers.
    pub fn description(&self) -> String {
        match &self.handle {
            DeviceHandle::Serial {
                description: Some(d),
                ..
            } => d.clone(),
            DeviceHandle::Serial { port, .. } => port.clone(),
            #[cfg(feature = "ble")]
            DeviceHandle::Ble { address } => format!("{} ({})", self.name, address),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self.handle {
            DeviceHandle::Serial { .. } => "dongle",
            #[cfg(feature = "ble")]
            DeviceHandle::Ble { .. } => "direct",
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.description())
    }
}

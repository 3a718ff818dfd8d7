//! WULPUS ultrasound probe acquisition link.
//!
//! Frames reach the host either through the USB dongle (a 4 Mbaud serial link) or
//! straight from the probe over BLE. [`Connection`] hides the difference behind a small
//! blocking API:
//!
//! 1. [`Connection::list_available`] to discover probes or dongles
//! 2. [`Connection::open`] one of them
//! 3. [`Connection::send_config`] with a configuration package
//! 4. [`Connection::receive_frame`] in a loop, one [`AcquisitionFrame`] per acquisition
//!
//! Every frame carries [`ACQ_LENGTH_SAMPLES`] signed 16-bit RF samples plus the channel
//! id and acquisition number assigned by the probe.
//!
//! Python bindings are built with the `python` feature; BLE needs the default `ble`
//! feature and BlueZ.

pub mod assembler;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod errors;
pub mod logging;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use assembler::{AssemblerState, AssemblerStats, FrameAssembler};
pub use codec::{AcquisitionFrame, FrameCodec, ACQ_LENGTH_SAMPLES};
pub use config::ConnectionConfig;
pub use connection::{CallStats, Connection, TransportState};
pub use device::{DeviceDescriptor, DeviceHandle};
pub use errors::*;
#[cfg(feature = "ble")]
pub use transport::BleTransport;
pub use transport::{SerialTransport, Transport, TransportKind};

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("worker runtime error: {0}")]
    Runtime(String),
    #[error("connection is shutting down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[cfg(feature = "ble")]
    #[error("bluez: {0}")]
    Bluez(#[from] bluer::Error),
    #[error("no bluetooth adapter available: {0}")]
    NoAdapter(String),
    #[error("service not found: {uuid}")]
    ServiceNotFound { uuid: String },
    #[error("characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: String },
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("not a BLE device: {0}")]
    WrongHandle(String),
}

/// Reasons a raw buffer could not be turned into an acquisition frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("sample count mismatch: expected {expected}, got {actual}")]
    SampleCount { expected: usize, actual: usize },
}

#[cfg(feature = "ble")]
impl From<bluer::Error> for DriverError {
    fn from(e: bluer::Error) -> Self {
        DriverError::Bluetooth(BluetoothError::Bluez(e))
    }
}

impl DriverError {
    /// True when the link itself is gone and the connection has to be reopened.
    pub fn is_disconnect(&self) -> bool {
        match self {
            DriverError::Bluetooth(BluetoothError::NotConnected(_)) => true,
            DriverError::Serial(e) => e.kind == serialport::ErrorKind::NoDevice,
            DriverError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_links_count_as_disconnects() {
        assert!(DriverError::from(BluetoothError::NotConnected("gone".into())).is_disconnect());
        assert!(DriverError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(DriverError::from(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "unplugged"
        ))
        .is_disconnect());

        assert!(!DriverError::Timeout("slow".into()).is_disconnect());
        assert!(!DriverError::from(DecodeError::Length {
            expected: 807,
            actual: 3
        })
        .is_disconnect());
    }
}

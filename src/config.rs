use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dongle UART speed.
pub const SERIAL_BAUD_RATE: u32 = 4_000_000;

/// Port timeout for serial reads and writes.
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a BLE scan listens for advertisements.
pub const SCAN_DURATION: Duration = Duration::from_secs(5);

/// Upper bound on a BLE connect + service resolution.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Notifications buffered between the BLE stream and the assembler (16 frames).
pub const NOTIFICATION_QUEUE_DEPTH: usize = 64;

/// Tunables for a [`Connection`](crate::Connection) and its transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub scan_duration: Duration,
    pub connect_timeout: Duration,
    pub serial_baud_rate: u32,
    pub serial_timeout: Duration,
    /// Bound on a single `receive_frame` wait. `None` waits until a frame, an error or
    /// shutdown.
    pub receive_timeout: Option<Duration>,
    pub notification_queue_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_duration: SCAN_DURATION,
            connect_timeout: CONNECT_TIMEOUT,
            serial_baud_rate: SERIAL_BAUD_RATE,
            serial_timeout: SERIAL_TIMEOUT,
            receive_timeout: None,
            notification_queue_depth: NOTIFICATION_QUEUE_DEPTH,
        }
    }
}

impl ConnectionConfig {
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }
}

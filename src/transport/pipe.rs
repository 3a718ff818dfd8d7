//! Notification queue feeding the BLE frame assembler.
//!
//! Packets arrive on a bounded channel filled by the notification forwarder. Frames are
//! assembled on the consumer side, and a read hands out only the newest complete frame:
//! older frames that completed while nobody was reading are skipped.

use log::{debug, trace};
use tokio::sync::mpsc;

use crate::assembler::{AssemblerStats, FrameAssembler};
use crate::codec::{decode_ble, AcquisitionFrame};
use crate::errors::{BluetoothError, Result};

pub struct NotificationPipe {
    packets: mpsc::Receiver<Vec<u8>>,
    assembler: FrameAssembler,
    superseded: u64,
}

impl NotificationPipe {
    /// Pipe plus the sender the forwarder pushes packets into.
    pub fn channel(depth: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (sender, packets) = mpsc::channel(depth.max(1));
        (sender, Self::new(packets))
    }

    pub fn new(packets: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            packets,
            assembler: FrameAssembler::new(),
            superseded: 0,
        }
    }

    /// Drop queued packets and any frame in progress. Returns the packets dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.packets.try_recv().is_ok() {
            dropped += 1;
        }
        self.assembler.reset();
        dropped
    }

    /// Wait for a complete frame, then return the newest one that is ready.
    ///
    /// `Ok(None)` when that frame does not decode. A closed channel means the peripheral
    /// went away.
    pub async fn next_frame(&mut self) -> Result<Option<AcquisitionFrame>> {
        let mut newest = loop {
            let packet = self.packets.recv().await.ok_or_else(|| {
                BluetoothError::NotConnected("notification stream ended".into())
            })?;
            if let Some(buffer) = self.assembler.push(&packet) {
                break buffer;
            }
        };

        let mut skipped = 0u64;
        while let Ok(packet) = self.packets.try_recv() {
            if let Some(buffer) = self.assembler.push(&packet) {
                newest = buffer;
                skipped += 1;
            }
        }
        if skipped > 0 {
            self.superseded += skipped;
            trace!("skipped {} stale frames", skipped);
        }

        match decode_ble(&newest) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                debug!("dropping malformed ble frame: {}", e);
                Ok(None)
            }
        }
    }

    pub fn assembler_stats(&self) -> AssemblerStats {
        self.assembler.stats()
    }

    /// Complete frames skipped because a newer one was ready.
    pub fn superseded_frames(&self) -> u64 {
        self.superseded
    }
}

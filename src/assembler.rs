//! Reassembly of BLE notifications into logical frames.
//!
//! The probe splits each 804-byte frame into four notifications. The first one starts
//! with the `0xFF` start-of-frame marker and is 202 bytes long; the other three carry
//! 201 payload bytes each and no marker. Notifications can be lost, so the assembler
//! never trusts a frame it did not see start: a continuation while idle is dropped, and a
//! start marker mid-frame abandons the stale frame and begins a new one.

use log::{debug, trace};

use crate::codec::{BLE_BYTES_PER_XFER, BLE_FRAME_LEN, BLE_XFERS_PER_FRAME};

/// First byte of the first notification of a frame.
pub const START_OF_FRAME: u8 = 0xFF;

/// Length of the first notification (marker + payload).
pub const FIRST_PACKET_LEN: usize = BLE_BYTES_PER_XFER + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    /// Number of packets of the current frame received so far (1..=3).
    Accumulating(u8),
}

/// Counters for diagnosing a lossy link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Frames handed out.
    pub frames: u64,
    /// Packets thrown away because no frame was in progress.
    pub dropped_packets: u64,
    /// Frames discarded before completion (restart marker or reset).
    pub abandoned_frames: u64,
}

#[derive(Debug)]
pub struct FrameAssembler {
    packets_received: usize,
    buffer: Vec<u8>,
    stats: AssemblerStats,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            packets_received: 0,
            buffer: Vec::with_capacity(BLE_FRAME_LEN),
            stats: AssemblerStats::default(),
        }
    }

    pub fn state(&self) -> AssemblerState {
        match self.packets_received {
            0 => AssemblerState::Idle,
            n => AssemblerState::Accumulating(n as u8),
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Feed one notification. Returns the completed frame buffer on the last packet.
    pub fn push(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        if is_frame_start(packet) {
            if self.packets_received > 0 {
                debug!(
                    "start marker after {} packets, abandoning partial frame",
                    self.packets_received
                );
                self.stats.abandoned_frames += 1;
            }
            self.buffer.clear();
            self.buffer.extend_from_slice(&packet[1..]);
            self.packets_received = 1;
            return None;
        }

        if self.packets_received == 0 {
            trace!("dropping {}-byte packet outside of a frame", packet.len());
            self.stats.dropped_packets += 1;
            return None;
        }

        self.buffer.extend_from_slice(packet);
        self.packets_received += 1;

        if self.packets_received < BLE_XFERS_PER_FRAME {
            return None;
        }

        self.packets_received = 0;
        self.stats.frames += 1;
        let frame = std::mem::replace(&mut self.buffer, Vec::with_capacity(BLE_FRAME_LEN));
        trace!("frame complete: {} bytes", frame.len());
        Some(frame)
    }

    /// Drop whatever is in progress and return to `Idle`.
    pub fn reset(&mut self) {
        if self.packets_received > 0 {
            self.stats.abandoned_frames += 1;
        }
        self.packets_received = 0;
        self.buffer.clear();
    }
}

fn is_frame_start(packet: &[u8]) -> bool {
    packet.len() == FIRST_PACKET_LEN && packet[0] == START_OF_FRAME
}

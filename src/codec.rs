//! Acquisition frame decoding.
//!
//! Both transports deliver the same logical record: a channel id, a 16-bit acquisition
//! number and [`ACQ_LENGTH_SAMPLES`] signed 16-bit RF samples, all little-endian. They differ
//! in framing:
//!
//! - **Dongle (serial)**: an 807-byte blob. The first four bytes are a dongle preamble that
//!   carries nothing the host uses; the record header starts at byte 4.
//! - **Direct (BLE)**: an 804-byte buffer reassembled from four notifications. The header
//!   starts at byte 0 and the sample region carries one stray byte that must be cut out
//!   before the samples line up.

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

/// Number of RF samples in one acquisition.
pub const ACQ_LENGTH_SAMPLES: usize = 400;

/// Bytes occupied by the samples once all framing is removed.
const SAMPLE_BYTES: usize = ACQ_LENGTH_SAMPLES * 2;

/// Channel id (1 byte) + acquisition number (2 bytes).
const HEADER_LEN: usize = 3;

/// Leading dongle bytes before the record header.
const DONGLE_PREAMBLE_LEN: usize = 4;

/// Size of the blob that follows the `START\n` line on the serial link.
pub const DONGLE_FRAME_LEN: usize = SAMPLE_BYTES + 7;

/// Payload bytes carried by each BLE notification (marker excluded).
pub const BLE_BYTES_PER_XFER: usize = 201;

/// Notifications making up one BLE frame.
pub const BLE_XFERS_PER_FRAME: usize = 4;

/// Logical BLE frame size after reassembly.
pub const BLE_FRAME_LEN: usize = BLE_BYTES_PER_XFER * BLE_XFERS_PER_FRAME;

/// Offset of the stray byte inside the BLE sample region (i.e. relative to byte 3).
/// Where it comes from is not known; the offset is fixed.
pub const BLE_STRAY_BYTE_OFFSET: usize = 197;

/// One decoded acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionFrame {
    /// RF samples, always [`ACQ_LENGTH_SAMPLES`] long.
    pub samples: Vec<i16>,
    /// Sequence number assigned by the probe within a measurement run.
    pub acquisition_number: u16,
    /// TX/RX configuration that produced this frame.
    pub channel_id: u8,
}

/// Which wire layout a buffer follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    Dongle,
    Ble,
}

impl FrameCodec {
    /// Exact buffer length this codec accepts.
    pub fn frame_len(self) -> usize {
        match self {
            FrameCodec::Dongle => DONGLE_FRAME_LEN,
            FrameCodec::Ble => BLE_FRAME_LEN,
        }
    }

    pub fn decode(self, buf: &[u8]) -> Result<AcquisitionFrame, DecodeError> {
        match self {
            FrameCodec::Dongle => decode_dongle(buf),
            FrameCodec::Ble => decode_ble(buf),
        }
    }
}

/// Decode the blob read after a `START\n` line on the serial link.
pub fn decode_dongle(buf: &[u8]) -> Result<AcquisitionFrame, DecodeError> {
    check_len(buf, DONGLE_FRAME_LEN)?;

    let record = &buf[DONGLE_PREAMBLE_LEN..];
    let (channel_id, acquisition_number) = parse_header(record);
    let samples = samples_from_le(&record[HEADER_LEN..])?;

    Ok(AcquisitionFrame {
        samples,
        acquisition_number,
        channel_id,
    })
}

/// Decode a reassembled BLE frame, cutting out the stray byte.
pub fn decode_ble(buf: &[u8]) -> Result<AcquisitionFrame, DecodeError> {
    check_len(buf, BLE_FRAME_LEN)?;

    let (channel_id, acquisition_number) = parse_header(buf);
    let region = &buf[HEADER_LEN..];

    let mut spliced = Vec::with_capacity(region.len() - 1);
    spliced.extend_from_slice(&region[..BLE_STRAY_BYTE_OFFSET]);
    spliced.extend_from_slice(&region[BLE_STRAY_BYTE_OFFSET + 1..]);
    let samples = samples_from_le(&spliced)?;

    Ok(AcquisitionFrame {
        samples,
        acquisition_number,
        channel_id,
    })
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), DecodeError> {
    if buf.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn parse_header(record: &[u8]) -> (u8, u16) {
    let channel_id = record[0];
    let acquisition_number = u16::from_le_bytes([record[1], record[2]]);
    (channel_id, acquisition_number)
}

fn samples_from_le(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    let chunks = bytes.chunks_exact(2);
    if !chunks.remainder().is_empty() || chunks.len() != ACQ_LENGTH_SAMPLES {
        return Err(DecodeError::SampleCount {
            expected: ACQ_LENGTH_SAMPLES,
            actual: chunks.len(),
        });
    }
    Ok(chunks.map(|c| i16::from_le_bytes([c[0], c[1]])).collect())
}

//! Frame scanning and multi-packet frame construction.

use tracing::{trace, warn};

use super::{Packet, crc16};
use crate::constants::*;
use crate::util::align4;
use crate::{BusError, Result};

/// Outcome of scanning one transport buffer.
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Packets of every valid frame, in buffer order.
    pub packets: Vec<Packet>,
    /// Frames dropped for a CRC or length problem, including a truncated tail.
    pub malformed: usize,
}

/// Scan `buffer` for 4-byte aligned frames and decode their packets.
pub fn decode_frames(buffer: &[u8], timestamp: f64) -> DecodedFrames {
    let mut out = DecodedFrames::default();
    let mut offset = 0;

    while offset < buffer.len() {
        let rest = &buffer[offset..];
        if rest.len() < FRAME_HEADER_SIZE {
            warn!(offset, remaining = rest.len(), "truncated frame header, dropping tail");
            out.malformed += 1;
            break;
        }

        let size = rest[2] as usize;
        let frame_len = FRAME_HEADER_SIZE + size;
        if rest.len() < frame_len {
            warn!(offset, size, remaining = rest.len(), "truncated frame body, dropping tail");
            out.malformed += 1;
            break;
        }

        let frame = &rest[..frame_len];
        match decode_one(frame, timestamp) {
            Ok(packets) => out.packets.extend(packets),
            Err(err) => {
                warn!(offset, error = %err, "dropping frame");
                out.malformed += 1;
            }
        }
        offset += align4(frame_len);
    }

    trace!(packets = out.packets.len(), malformed = out.malformed, "decoded buffer");
    out
}

fn decode_one(frame: &[u8], timestamp: f64) -> Result<Vec<Packet>> {
    let size = frame[2] as usize;
    if size < 4 {
        return Err(BusError::malformed(format!("frame size {size} is below one packet header")));
    }

    let expected = u16::from_le_bytes([frame[0], frame[1]]);
    let actual = crc16(&frame[2..]);
    if expected != actual {
        return Err(BusError::malformed(format!(
            "crc mismatch: header {expected:#06x}, computed {actual:#06x}"
        )));
    }

    let flags = frame[3];
    let device_id = super::DeviceId::from_slice(&frame[4..12])?;
    let body = &frame[FRAME_HEADER_SIZE..];

    let mut packets = Vec::new();
    let mut pos = 0;
    while pos + 4 <= body.len() {
        let payload_len = body[pos] as usize;
        let end = pos + 4 + payload_len;
        if end > body.len() {
            return Err(BusError::malformed(format!(
                "packet at {pos} declares {payload_len} bytes past the frame end"
            )));
        }
        // Only the first packet of a frame may request an ack.
        let packet_flags =
            if packets.is_empty() { flags } else { flags & !FRAME_FLAG_ACK_REQUESTED };
        packets.push(Packet::from_parts(
            packet_flags,
            device_id,
            body[pos + 1],
            u16::from_le_bytes([body[pos + 2], body[pos + 3]]),
            &body[pos + 4..end],
            timestamp,
            expected,
        ));
        pos = align4(end);
    }

    Ok(packets)
}

/// Pack several packets addressed alike into one frame.
///
/// Every packet must share the device identifier and flags of the first one, and the
/// padded bodies must fit the frame body limit.
pub fn frame_from_packets(packets: &[Packet]) -> Result<Vec<u8>> {
    let first = packets
        .first()
        .ok_or_else(|| BusError::parse("frame construction", "no packets"))?;

    let mut body = Vec::with_capacity(MAX_FRAME_BODY_SIZE);
    for pkt in packets {
        if pkt.device_id() != first.device_id() || pkt.flags() != first.flags() {
            return Err(BusError::parse(
                "frame construction",
                "packets differ in device identifier or flags",
            ));
        }
        body.resize(align4(body.len()), 0);
        pkt.write_body(&mut body);
    }
    if body.len() > MAX_FRAME_BODY_SIZE {
        return Err(BusError::parse(
            "frame construction",
            format!("{} body bytes exceed the {} byte limit", body.len(), MAX_FRAME_BODY_SIZE),
        ));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&[0, 0, body.len() as u8, first.flags()]);
    frame.extend_from_slice(first.device_id().as_bytes());
    frame.extend_from_slice(&body);
    let crc = crc16(&frame[2..]);
    frame[..2].copy_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

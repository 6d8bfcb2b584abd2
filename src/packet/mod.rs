//! Packet data model and binary framing.
//!
//! A transport buffer carries one or more frames. Each frame is a 12-byte frame
//! header followed by one or more packet bodies:
//!
//! ```text
//! frame header  crc u16 | size u8 | flags u8 | device identifier [u8; 8]
//! packet body   payload size u8 | service index u8 | service command u16 | payload | pad to 4
//! ```
//!
//! The CRC covers everything from `size` up to the end of the last body. A frame whose
//! CRC does not match is dropped without affecting its neighbours in the same buffer.

mod crc;
mod device_id;
mod frame;

use std::sync::Arc;

use crate::constants::*;
use crate::{BusError, Result};

pub use crc::crc16;
pub use device_id::DeviceId;
pub use frame::{DecodedFrames, decode_frames, frame_from_packets};

/// One addressed command or report.
///
/// Packets are immutable once built; builders consume and return `self`, and
/// [`Packet::clone_packet`] produces the fresh copy used when re-sending.
#[derive(Debug, Clone)]
pub struct Packet {
    flags: u8,
    service_index: u8,
    service_command: u16,
    device_id: DeviceId,
    data: Arc<[u8]>,
    timestamp: f64,
    /// CRC of the frame this packet was decoded from.
    frame_crc: Option<u16>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
            && self.service_index == other.service_index
            && self.service_command == other.service_command
            && self.device_id == other.device_id
            && self.data == other.data
            && self.timestamp == other.timestamp
    }
}

impl Packet {
    /// Build an outgoing packet from a command code and payload.
    pub fn from_command(service_command: u16, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(BusError::parse(
                "packet payload",
                format!("{} bytes exceeds the {} byte limit", data.len(), MAX_PAYLOAD_SIZE),
            ));
        }
        Ok(Self {
            flags: 0,
            service_index: 0,
            service_command,
            device_id: DeviceId::default(),
            data: Arc::from(data),
            timestamp: 0.0,
            frame_crc: None,
        })
    }

    /// Build a packet without payload.
    pub fn only_header(service_command: u16) -> Self {
        Self {
            flags: 0,
            service_index: 0,
            service_command,
            device_id: DeviceId::default(),
            data: Arc::from(&[][..]),
            timestamp: 0.0,
            frame_crc: None,
        }
    }

    /// Announce report of a device exposing `service_classes` after the control service.
    pub fn announce(device_id: DeviceId, flags: u16, service_classes: &[u32]) -> Result<Self> {
        let mut data = Vec::with_capacity(4 + service_classes.len() * 4);
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&[0, 0]);
        for class in service_classes {
            data.extend_from_slice(&class.to_le_bytes());
        }
        Ok(Self::from_command(CMD_ADVERTISEMENT_DATA, &data)?
            .into_report(device_id, SERVICE_INDEX_CTRL))
    }

    /// Report of register `code` from `device_id`/`service_index`.
    pub fn register_report(
        device_id: DeviceId,
        service_index: u8,
        code: u16,
        data: &[u8],
    ) -> Result<Self> {
        Ok(Self::from_command(CMD_GET_REG | (code & CMD_REG_MASK), data)?
            .into_report(device_id, service_index))
    }

    /// CRC acknowledgement sent by `device_id` for a frame carrying `crc`.
    pub fn crc_ack(device_id: DeviceId, crc: u16) -> Self {
        Self::only_header(crc).into_report(device_id, SERVICE_INDEX_CRC_ACK)
    }

    /// Address the packet as a command to a service on a device.
    pub fn into_command(mut self, device_id: DeviceId, service_index: u8) -> Self {
        self.device_id = device_id;
        self.service_index = service_index & SERVICE_INDEX_MASK;
        self.flags = (self.flags | FRAME_FLAG_COMMAND) & !FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS;
        self
    }

    /// Address the packet as a report emitted by a service on a device.
    pub fn into_report(mut self, device_id: DeviceId, service_index: u8) -> Self {
        self.device_id = device_id;
        self.service_index = service_index & SERVICE_INDEX_MASK;
        self.flags &= !(FRAME_FLAG_COMMAND | FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS);
        self
    }

    /// Address the packet to every service of a class on the bus.
    pub fn into_multi_command(mut self, service_class: u32) -> Self {
        self.device_id = DeviceId::from_service_class(service_class);
        self.service_index = SERVICE_INDEX_MASK;
        self.flags |= FRAME_FLAG_COMMAND | FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS;
        self
    }

    pub fn with_requires_ack(mut self, requires_ack: bool) -> Self {
        if requires_ack {
            self.flags |= FRAME_FLAG_ACK_REQUESTED;
        } else {
            self.flags &= !FRAME_FLAG_ACK_REQUESTED;
        }
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Fresh copy for re-sending; drops the received-frame CRC.
    pub fn clone_packet(&self) -> Self {
        Self { frame_crc: None, ..self.clone() }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn service_index(&self) -> u8 {
        self.service_index
    }

    pub fn service_command(&self) -> u16 {
        self.service_command
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_command(&self) -> bool {
        self.flags & FRAME_FLAG_COMMAND != 0
    }

    pub fn is_report(&self) -> bool {
        !self.is_command()
    }

    pub fn requires_ack(&self) -> bool {
        self.flags & FRAME_FLAG_ACK_REQUESTED != 0
    }

    pub fn is_multi_command(&self) -> bool {
        self.flags & FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS != 0
    }

    /// Service class addressed by a multi-command packet.
    pub fn multi_command_class(&self) -> Option<u32> {
        self.is_multi_command().then(|| {
            let b = self.device_id.as_bytes();
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    pub fn is_register_get(&self) -> bool {
        self.service_index <= SERVICE_INDEX_MAX_NORMAL
            && self.service_command & CMD_TYPE_MASK == CMD_GET_REG
    }

    pub fn is_register_set(&self) -> bool {
        self.service_index <= SERVICE_INDEX_MAX_NORMAL
            && self.service_command & CMD_TYPE_MASK == CMD_SET_REG
    }

    pub fn register_code(&self) -> Option<u16> {
        (self.is_register_get() || self.is_register_set())
            .then_some(self.service_command & CMD_REG_MASK)
    }

    pub fn is_event(&self) -> bool {
        self.is_report()
            && self.service_index <= SERVICE_INDEX_MAX_NORMAL
            && self.service_command & CMD_EVENT_MASK != 0
    }

    pub fn event_code(&self) -> Option<u8> {
        self.is_event().then_some((self.service_command & CMD_EVENT_CODE_MASK) as u8)
    }

    pub fn event_counter(&self) -> Option<u8> {
        self.is_event().then_some(
            (self.service_command >> CMD_EVENT_COUNTER_POS) as u8 & CMD_EVENT_COUNTER_MASK,
        )
    }

    pub fn is_announce(&self) -> bool {
        self.is_report()
            && self.service_index == SERVICE_INDEX_CTRL
            && self.service_command == CMD_ADVERTISEMENT_DATA
    }

    pub fn is_crc_ack(&self) -> bool {
        self.service_index == SERVICE_INDEX_CRC_ACK
    }

    pub fn is_pipe(&self) -> bool {
        self.service_index == SERVICE_INDEX_PIPE
    }

    pub fn pipe_port(&self) -> Option<u16> {
        self.is_pipe().then_some(self.service_command >> PIPE_PORT_SHIFT)
    }

    pub fn pipe_counter(&self) -> Option<u16> {
        self.is_pipe().then_some(self.service_command & PIPE_COUNTER_MASK)
    }

    pub fn is_pipe_close(&self) -> bool {
        self.is_pipe() && self.service_command & PIPE_CLOSE_MASK != 0
    }

    pub fn is_pipe_meta(&self) -> bool {
        self.is_pipe() && self.service_command & PIPE_METADATA_MASK != 0
    }

    /// CRC identifying this packet for acknowledgements.
    ///
    /// For a decoded packet this is the CRC of the frame it arrived in; otherwise it is the
    /// CRC of the single-packet frame [`Packet::to_frame`] would produce.
    pub fn crc(&self) -> u16 {
        self.frame_crc.unwrap_or_else(|| {
            let frame = self.to_frame();
            u16::from_le_bytes([frame[0], frame[1]])
        })
    }

    /// Encode as a single-packet frame with a freshly computed CRC.
    pub fn to_frame(&self) -> Vec<u8> {
        let body_len = 4 + self.data.len();
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
        buf.extend_from_slice(&[0, 0, body_len as u8, self.flags]);
        buf.extend_from_slice(self.device_id.as_bytes());
        self.write_body(&mut buf);
        let crc = crc16(&buf[2..]);
        buf[..2].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode every packet of every valid frame in `buffer`, stamping them with `timestamp`.
    ///
    /// Malformed frames and trailing garbage are logged and skipped; this never fails.
    pub fn from_frame(buffer: &[u8], timestamp: f64) -> Vec<Packet> {
        decode_frames(buffer, timestamp).packets
    }

    fn write_body(&self, buf: &mut Vec<u8>) {
        buf.push(self.data.len() as u8);
        buf.push(self.service_index);
        buf.extend_from_slice(&self.service_command.to_le_bytes());
        buf.extend_from_slice(&self.data);
    }

    pub(crate) fn from_parts(
        flags: u8,
        device_id: DeviceId,
        service_index: u8,
        service_command: u16,
        data: &[u8],
        timestamp: f64,
        frame_crc: u16,
    ) -> Self {
        Self {
            flags,
            service_index,
            service_command,
            device_id,
            data: Arc::from(data),
            timestamp,
            frame_crc: Some(frame_crc),
        }
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{} cmd={:#06x} [{}]",
            if self.is_command() { "to" } else { "from" },
            self.device_id.short_id(),
            self.service_index,
            self.service_command,
            crate::util::to_hex(&self.data)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device() -> DeviceId {
        DeviceId::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
    }

    #[test]
    fn rejects_oversized_payload() {
        let data = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(Packet::from_command(CMD_GET_REG, &data).is_err());
        assert!(Packet::from_command(CMD_GET_REG, &data[..MAX_PAYLOAD_SIZE]).is_ok());
    }

    #[test]
    fn header_layout_is_little_endian() {
        let pkt = Packet::from_command(0x1234, &[0xaa, 0xbb]).unwrap().into_command(device(), 3);
        let frame = pkt.to_frame();

        assert_eq!(frame.len(), 18);
        assert_eq!(frame[2], 6);
        assert_eq!(frame[3], FRAME_FLAG_COMMAND);
        assert_eq!(&frame[4..12], device().as_bytes());
        assert_eq!(frame[12], 2);
        assert_eq!(frame[13], 3);
        assert_eq!(&frame[14..16], &[0x34, 0x12]);
        assert_eq!(&frame[16..], &[0xaa, 0xbb]);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), crc16(&frame[2..]));
    }

    #[test]
    fn classifies_register_and_event_commands() {
        let get = Packet::only_header(CMD_GET_REG | REG_READING).into_report(device(), 1);
        assert!(get.is_register_get());
        assert_eq!(get.register_code(), Some(REG_READING));
        assert!(!get.is_event());

        let set = Packet::only_header(CMD_SET_REG | REG_INTENSITY).into_command(device(), 1);
        assert!(set.is_register_set());
        assert_eq!(set.register_code(), Some(REG_INTENSITY));

        let evt = Packet::only_header(CMD_EVENT_MASK | (5 << 8) | 0x03).into_report(device(), 2);
        assert!(evt.is_event());
        assert_eq!(evt.event_code(), Some(0x03));
        assert_eq!(evt.event_counter(), Some(5));
    }

    #[test]
    fn announce_builder_produces_control_report() {
        let pkt = Packet::announce(device(), ANNOUNCE_SUPPORTS_ACK, &[SRV_BUTTON]).unwrap();
        assert!(pkt.is_announce());
        assert_eq!(pkt.size(), 8);
        assert_eq!(&pkt.data()[4..], &SRV_BUTTON.to_le_bytes());
    }

    #[test]
    fn multi_command_carries_service_class() {
        let pkt = Packet::only_header(CMD_GET_REG | REG_READING).into_multi_command(SRV_BUTTON);
        assert!(pkt.is_multi_command());
        assert!(pkt.is_command());
        assert_eq!(pkt.multi_command_class(), Some(SRV_BUTTON));
    }

    #[test]
    fn pipe_fields_are_extracted() {
        let cmd = (0x1a5 << PIPE_PORT_SHIFT) | PIPE_CLOSE_MASK | 3;
        let pkt = Packet::only_header(cmd).into_command(device(), SERVICE_INDEX_PIPE);
        assert_eq!(pkt.pipe_port(), Some(0x1a5));
        assert_eq!(pkt.pipe_counter(), Some(3));
        assert!(pkt.is_pipe_close());
        assert!(!pkt.is_pipe_meta());
    }

    #[test]
    fn decoded_packet_keeps_frame_crc() {
        let pkt = Packet::from_command(0x10, &[1, 2, 3]).unwrap().into_command(device(), 1);
        let frame = pkt.to_frame();
        let decoded = Packet::from_frame(&frame, 0.0);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].crc(), pkt.crc());
    }

    proptest! {
        #[test]
        fn encode_then_decode_is_identity(
            flags in prop::sample::select(vec![0u8, FRAME_FLAG_COMMAND, FRAME_FLAG_ACK_REQUESTED | FRAME_FLAG_COMMAND]),
            id in any::<[u8; 8]>(),
            index in 0u8..=SERVICE_INDEX_MASK,
            command in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
            timestamp in 0.0f64..1.0e6,
        ) {
            let base = Packet::from_command(command, &data).unwrap();
            let pkt = if flags & FRAME_FLAG_COMMAND != 0 {
                base.into_command(DeviceId::new(id), index)
            } else {
                base.into_report(DeviceId::new(id), index)
            }
            .with_requires_ack(flags & FRAME_FLAG_ACK_REQUESTED != 0)
            .with_timestamp(timestamp);

            let decoded = Packet::from_frame(&pkt.to_frame(), timestamp);
            prop_assert_eq!(decoded.len(), 1);
            prop_assert_eq!(&decoded[0], &pkt);
        }
    }
}

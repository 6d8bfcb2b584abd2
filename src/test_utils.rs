//! Test utilities: fixture lookup and packet builders.
//!
//! Shared by unit tests and the benchmarks (feature `benchmark`).

#![cfg(any(test, feature = "benchmark"))]

use std::path::{Path, PathBuf};

use crate::constants::{CMD_EVENT_COUNTER_POS, CMD_EVENT_MASK, CMD_GET_REG, CMD_REG_MASK, SRV_BUTTON};
use crate::packet::{DeviceId, Packet, frame_from_packets};
use crate::trace::Trace;

/// Device recorded in `test-data/button_press.trace`.
pub const BUTTON_TRACE_DEVICE: DeviceId =
    DeviceId::new([0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22, 0x33, 0x44]);

/// Error returned when a required fixture cannot be located.
#[derive(Debug, Clone)]
pub struct FixtureError {
    message: String,
}

impl std::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FixtureError {}

/// Path of a file under the crate's `test-data/` directory, which must exist.
pub fn fixture_path(name: impl AsRef<Path>) -> Result<PathBuf, FixtureError> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("test-data").join(name);
    if path.exists() {
        Ok(path)
    } else {
        Err(FixtureError { message: format!("Missing trace fixture: {}", path.display()) })
    }
}

/// The one-button trace shipped with the crate.
pub fn button_trace() -> Trace {
    let path = fixture_path("button_press.trace").expect("button trace fixture");
    Trace::from_file(path).expect("button trace parses")
}

pub fn announce(device: DeviceId, flags: u16, services: &[u32]) -> Packet {
    Packet::announce(device, flags, services).expect("announce fits in a packet")
}

pub fn reading(device: DeviceId, service_index: u8, register: u16, data: &[u8]) -> Packet {
    Packet::from_command(CMD_GET_REG | (register & CMD_REG_MASK), data)
        .expect("report fits in a packet")
        .into_report(device, service_index)
}

pub fn event(device: DeviceId, service_index: u8, code: u8, counter: u8) -> Packet {
    let command = CMD_EVENT_MASK | (u16::from(counter & 0x7f) << CMD_EVENT_COUNTER_POS) | u16::from(code);
    Packet::only_header(command).into_report(device, service_index)
}

/// Transport buffer of `count` button frames, each carrying a reading and an event.
pub fn button_buffer(count: usize) -> Vec<u8> {
    let mut buffer = Vec::new();
    for i in 0..count {
        let device = DeviceId::new([i as u8; 8]);
        let packets = [
            reading(device, 1, 0x101, &(i as u16).to_le_bytes()),
            event(device, 1, 1, i as u8),
        ];
        let frame = frame_from_packets(&packets).expect("two small packets fit");
        buffer.extend_from_slice(&frame);
        buffer.resize(buffer.len().next_multiple_of(4), 0);
    }
    buffer
}

/// Announce frames for the devices of [`button_buffer`].
pub fn button_announces(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| announce(DeviceId::new([i as u8; 8]), 1, &[SRV_BUTTON]).to_frame())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_frames;

    #[test]
    fn button_fixture_decodes_cleanly() {
        let trace = button_trace();
        assert_eq!(trace.len(), 8);
        for frame in trace.frames() {
            let decoded = decode_frames(&frame.data, frame.timestamp);
            assert_eq!(decoded.malformed, 0, "frame at {}", frame.timestamp);
            assert_eq!(decoded.packets[0].device_id(), BUTTON_TRACE_DEVICE);
        }
    }

    #[test]
    fn button_buffer_holds_two_packets_per_frame() {
        let decoded = decode_frames(&button_buffer(5), 0.0);
        assert_eq!(decoded.malformed, 0);
        assert_eq!(decoded.packets.len(), 10);
    }

    #[test]
    fn missing_fixture_is_reported() {
        let err = fixture_path("absent.trace").unwrap_err();
        assert!(err.to_string().contains("absent.trace"));
    }
}

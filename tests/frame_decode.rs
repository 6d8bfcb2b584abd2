//! Frame corruption is contained to the damaged frame, at decode and bus level.

use jacbus::{Bus, BusOptions, DeviceId, Packet, decode_frames};
use proptest::prelude::*;

fn frame(device: u8, value: u16) -> Vec<u8> {
    let mut frame = Packet::register_report(DeviceId::new([device; 8]), 1, 0x101, &value.to_le_bytes())
        .unwrap()
        .to_frame();
    frame.resize(frame.len().next_multiple_of(4), 0);
    frame
}

proptest! {
    #[test]
    fn one_flipped_bit_drops_only_its_frame(
        count in 2usize..6,
        victim in 0usize..6,
        byte in 2usize..16,
        bit in 0u8..8,
    ) {
        let victim = victim % count;
        let frames: Vec<Vec<u8>> = (0..count).map(|i| frame(i as u8 + 1, i as u16)).collect();
        let mut buffer = Vec::new();
        for (i, f) in frames.iter().enumerate() {
            let mut f = f.clone();
            // keep the size byte intact so the scan stays aligned
            if i == victim && byte != 2 {
                f[byte] ^= 1 << bit;
            }
            buffer.extend_from_slice(&f);
        }

        let decoded = decode_frames(&buffer, 0.0);
        if byte == 2 {
            prop_assert_eq!(decoded.malformed, 0);
            prop_assert_eq!(decoded.packets.len(), count);
        } else {
            prop_assert_eq!(decoded.malformed, 1);
            prop_assert_eq!(decoded.packets.len(), count - 1);
            let victim_id = DeviceId::new([victim as u8 + 1; 8]);
            prop_assert!(decoded.packets.iter().all(|p| p.device_id() != victim_id));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn bus_counts_malformed_frames_and_keeps_the_rest() {
    let bus = Bus::new(BusOptions::default()).unwrap();
    let mut buffer = frame(1, 10);
    let mut broken = frame(2, 20);
    broken[0] ^= 0xff;
    buffer.extend_from_slice(&broken);
    buffer.extend_from_slice(&frame(3, 30));

    bus.process_frame(&buffer);
    let stats = bus.stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.malformed_frames, 1);
    assert_eq!(stats.packets, 2);
    assert!(bus.device(DeviceId::new([2; 8])).is_none());

    // truncated tail
    bus.process_frame(&frame(4, 40)[..10]);
    assert_eq!(bus.stats().malformed_frames, 2);
}

//! Stream framers for byte-oriented links.
//!
//! Serial lines use COBS with a zero delimiter; sockets prefix each frame with its
//! length. Both accumulate partial input across reads.

use tracing::warn;

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{BusError, Result};

/// COBS framing with `0x00` as the frame delimiter.
#[derive(Debug, Default)]
pub struct CobsFramer {
    buf: Vec<u8>,
    overflowed: bool,
}

impl CobsFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one frame, delimiter included.
    pub fn encode(frame: &[u8]) -> Vec<u8> {
        let mut out = cobs::encode_vec(frame);
        out.push(0);
        out
    }

    /// Feed received bytes and return every complete frame they finish.
    ///
    /// Frames that fail to decode or exceed the maximum frame size are dropped.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in data {
            if byte != 0 {
                if self.buf.len() > MAX_FRAME_SIZE + 2 {
                    self.overflowed = true;
                } else {
                    self.buf.push(byte);
                }
                continue;
            }

            if self.overflowed {
                warn!("dropping oversized COBS frame");
            } else if !self.buf.is_empty() {
                match cobs::decode_in_place(&mut self.buf) {
                    Ok(len) => frames.push(self.buf[..len].to_vec()),
                    Err(_) => warn!(len = self.buf.len(), "dropping undecodable COBS frame"),
                }
            }
            self.buf.clear();
            self.overflowed = false;
        }
        frames
    }
}

/// One length byte followed by the frame.
#[derive(Debug, Default)]
pub struct LengthPrefixFramer {
    buf: Vec<u8>,
}

impl LengthPrefixFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one frame. Frames longer than a length byte can describe are rejected.
    pub fn encode(frame: &[u8]) -> Result<Vec<u8>> {
        let len = u8::try_from(frame.len()).map_err(|_| {
            BusError::malformed(format!("{} byte frame does not fit a length prefix", frame.len()))
        })?;
        let mut out = Vec::with_capacity(frame.len() + 1);
        out.push(len);
        out.extend_from_slice(frame);
        Ok(out)
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;
        while let Some(&len) = self.buf.get(offset) {
            let end = offset + 1 + len as usize;
            if end > self.buf.len() {
                break;
            }
            frames.push(self.buf[offset + 1..end].to_vec());
            offset = end;
        }
        self.buf.drain(..offset);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cobs_handles_split_reads_and_embedded_zeros() {
        let a = vec![0x01, 0x00, 0x02, 0x00, 0x00, 0x03];
        let b = vec![0xff; 40];
        let mut wire = CobsFramer::encode(&a);
        assert_eq!(wire.iter().filter(|&&x| x == 0).count(), 1);
        wire.extend(CobsFramer::encode(&b));

        let mut framer = CobsFramer::new();
        let (first, second) = wire.split_at(5);
        let mut frames = framer.push(first);
        frames.extend(framer.push(second));
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn cobs_drops_oversized_frames_and_recovers() {
        let mut framer = CobsFramer::new();
        assert!(framer.push(&vec![0x11; MAX_FRAME_SIZE + 16]).is_empty());
        assert!(framer.push(&[0]).is_empty());
        assert_eq!(framer.push(&CobsFramer::encode(&[1, 2, 3])), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn length_prefix_reassembles_fragments() {
        let mut wire = LengthPrefixFramer::encode(&[1, 2, 3]).unwrap();
        wire.extend(LengthPrefixFramer::encode(&[]).unwrap());
        wire.extend(LengthPrefixFramer::encode(&[9; 20]).unwrap());

        let mut framer = LengthPrefixFramer::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            frames.extend(framer.push(chunk));
        }
        assert_eq!(frames, vec![vec![1, 2, 3], vec![], vec![9; 20]]);
    }

    #[test]
    fn length_prefix_rejects_frames_past_one_length_byte() {
        let frame = vec![0x5a; 267];
        let err = LengthPrefixFramer::encode(&frame).unwrap_err();
        assert!(matches!(err, BusError::MalformedFrame { .. }), "unexpected {err}");
        assert!(err.to_string().contains("267"));

        let largest = LengthPrefixFramer::encode(&[0x5a; 255]).unwrap();
        assert_eq!((largest[0], largest.len()), (255, 256));
    }
}

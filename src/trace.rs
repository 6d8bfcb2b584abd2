//! Recorded traffic: timestamped frames, their text format and a live recorder.
//!
//! The text format holds one frame per line, `<timestamp ms> <frame hex>`. Blank lines
//! and lines starting with `#` are ignored.
//!
//! ```text
//! # button press
//! 0 e3a60c00aabbccddeeff0011080000000100000063a27314
//! 12.5 ...
//! ```

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{Bus, BusEvent};
use crate::util::{from_hex, to_hex};
use crate::{BusError, Result};

/// One received transport buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Bus time in milliseconds.
    pub timestamp: f64,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(timestamp: f64, data: Vec<u8>) -> Self {
        Self { timestamp, data }
    }
}

/// Frames ordered by timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    frames: Vec<Frame>,
}

impl Trace {
    pub fn new(mut frames: Vec<Frame>) -> Self {
        frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time between the first and last frame.
    pub fn duration(&self) -> f64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    pub fn parse_text(text: &str) -> Result<Self> {
        let mut frames = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let context = || format!("trace line {}", number + 1);
            let (timestamp, hex) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| BusError::parse(context(), "expected `<timestamp> <hex>`"))?;
            let timestamp: f64 = timestamp
                .parse()
                .map_err(|e| BusError::parse(context(), format!("bad timestamp: {e}")))?;
            let data = from_hex(hex.trim())
                .map_err(|e| BusError::parse(context(), e.to_string()))?;
            frames.push(Frame { timestamp, data });
        }
        Ok(Self::new(frames))
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            let _ = writeln!(out, "{} {}", frame.timestamp, to_hex(&frame.data));
        }
        out
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| BusError::File { path: path.to_path_buf(), source })?;
        let trace = Self::parse_text(&text)?;
        info!(path = %path.display(), frames = trace.len(), "loaded trace");
        Ok(trace)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_text())
            .map_err(|source| BusError::File { path: path.to_path_buf(), source })
    }
}

/// Records every packet the bus receives as a single-packet frame.
pub struct TraceRecorder {
    frames: Arc<Mutex<Vec<Frame>>>,
    cancel: CancellationToken,
}

impl TraceRecorder {
    pub fn start(bus: &Bus) -> Self {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let mut events = bus.subscribe();
        let sink = frames.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(BusEvent::PacketReceive(pkt)) => {
                            sink.lock().push(Frame::new(pkt.timestamp(), pkt.to_frame()));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => debug!(skipped, "trace recorder dropped packets"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        Self { frames, cancel }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Frames recorded so far, recording continues.
    pub fn snapshot(&self) -> Trace {
        Trace::new(self.frames.lock().clone())
    }

    pub fn stop(self) -> Trace {
        self.cancel.cancel();
        Trace::new(std::mem::take(&mut *self.frames.lock()))
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder").field("frames", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusOptions;
    use crate::packet::{DeviceId, Packet};
    use std::time::Duration;

    #[test]
    fn parses_comments_and_sorts() {
        let trace = Trace::parse_text("# header\n\n300 0a0b\n0 01\n100\t0203\n").unwrap();
        let stamps: Vec<f64> = trace.frames().iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![0.0, 100.0, 300.0]);
        assert_eq!(trace.frames()[1].data, vec![2, 3]);
        assert_eq!(trace.duration(), 300.0);
    }

    #[test]
    fn text_round_trip() {
        let trace = Trace::new(vec![Frame::new(0.0, vec![1, 2]), Frame::new(12.5, vec![0xff])]);
        assert_eq!(Trace::parse_text(&trace.to_text()).unwrap(), trace);
    }

    #[test]
    fn bad_lines_name_their_line_number() {
        let err = Trace::parse_text("0 00\nnope\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(Trace::parse_text("x 00").is_err());
        assert!(Trace::parse_text("0 0g").is_err());
        assert_eq!(Trace::default().duration(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_captures_received_packets() {
        let bus = Bus::new(BusOptions::default()).unwrap();
        let recorder = TraceRecorder::start(&bus);
        let pkt = Packet::announce(DeviceId::new([3; 8]), 1, &[]).unwrap();
        bus.process_packet(pkt.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;

        let trace = recorder.stop();
        assert_eq!(trace.len(), 1);
        assert_eq!(Packet::from_frame(&trace.frames()[0].data, 0.0)[0].data(), pkt.data());
    }
}

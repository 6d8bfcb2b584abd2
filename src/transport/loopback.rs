//! In-process transport for tests and simulations.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{TransportIo, TransportKind, TransportSink};
use crate::packet::Packet;
use crate::{BusError, Result};

#[derive(Debug, Default)]
struct Shared {
    sink: Option<TransportSink>,
    sent: Vec<Vec<u8>>,
    fail_open: bool,
    fail_send: bool,
}

/// Transport that records written frames and lets the test inject received ones.
#[derive(Debug)]
pub struct LoopbackTransport {
    kind: TransportKind,
    shared: Arc<Mutex<Shared>>,
}

/// Test-side control of a [`LoopbackTransport`].
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackTransport {
    pub fn new() -> (Self, LoopbackHandle) {
        Self::with_kind(TransportKind::Loopback)
    }

    /// Loopback that reports itself as another kind.
    pub fn with_kind(kind: TransportKind) -> (Self, LoopbackHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (Self { kind, shared: shared.clone() }, LoopbackHandle { shared })
    }
}

impl LoopbackHandle {
    /// Frames written so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.lock().sent.clone()
    }

    /// Packets decoded from the frames written so far.
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.shared.lock().sent.iter().flat_map(|f| Packet::from_frame(f, 0.0)).collect()
    }

    pub fn clear_sent(&self) {
        self.shared.lock().sent.clear();
    }

    /// Deliver a received buffer. Returns `false` when the transport is not open.
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        match &self.shared.lock().sink {
            Some(sink) => sink.frame(frame),
            None => false,
        }
    }

    /// Simulate the link dropping.
    pub fn drop_link(&self, reason: &str) -> bool {
        match self.shared.lock().sink.take() {
            Some(sink) => sink.lost(reason),
            None => false,
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.shared.lock().fail_open = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.shared.lock().fail_send = fail;
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().sink.is_some()
    }
}

#[async_trait]
impl TransportIo for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&mut self, _background: bool, sink: TransportSink) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.fail_open {
            return Err(BusError::transport(self.kind, "open refused"));
        }
        shared.sink = Some(sink);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.lock().sink = None;
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.fail_send {
            return Err(BusError::transport(self.kind, "write failed"));
        }
        shared.sent.push(frame.to_vec());
        Ok(())
    }
}

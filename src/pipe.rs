//! Inbound pipes: bulk reads that span many packets.
//!
//! The reader picks a random port and hands the remote side an open token (our device
//! id plus the port). The remote side then streams commands addressed to us on the pipe
//! service index, each tagged with the port and a 5-bit counter. The stream ends with
//! a packet carrying the close flag or with an empty data chunk.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use crate::bus::{Bus, BusEvent};
use crate::constants::{PIPE_COUNTER_MASK, PIPE_PORT_SHIFT, SERVICE_INDEX_PIPE};
use crate::packet::{DeviceId, Packet};
use crate::{BusError, Result};

const PORT_MASK: u16 = 0x1ff;

/// Collects the chunks of one inbound pipe.
#[derive(Debug)]
pub struct InPipeReader {
    bus: Bus,
    port: u16,
    events: broadcast::Receiver<BusEvent>,
    next_counter: u16,
    chunks: Vec<Vec<u8>>,
    meta: Vec<Vec<u8>>,
}

impl InPipeReader {
    /// Allocate a port and start listening before the open command goes out.
    pub fn new(bus: &Bus) -> Self {
        Self {
            bus: bus.clone(),
            port: rand::random::<u16>() & PORT_MASK,
            events: bus.subscribe(),
            next_counter: 0,
            chunks: Vec::new(),
            meta: Vec::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Command packet asking the remote side to stream into this pipe.
    ///
    /// Payload: `self device id [8] | port u16 | reserved u16`.
    pub fn open_command(&self, command: u16) -> Result<Packet> {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(self.bus.self_device_id().as_bytes());
        data.extend_from_slice(&self.port.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        Packet::from_command(command, &data)
    }

    /// Metadata packets seen so far, kept apart from the data chunks.
    pub fn meta(&self) -> &[Vec<u8>] {
        &self.meta
    }

    /// Read data chunks in counter order until the pipe closes.
    ///
    /// On timeout the chunks received so far come back inside
    /// [`BusError::PipeTimeout`].
    pub async fn read_data(&mut self, timeout: Duration) -> Result<Vec<Vec<u8>>> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(BusEvent::SelfCommand(pkt)) => {
                        if self.accept(&pkt) {
                            debug!(port = self.port, chunks = self.chunks.len(), "pipe closed");
                            return Ok(std::mem::take(&mut self.chunks));
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(port = self.port, skipped, "pipe reader lagged behind bus events");
                    }
                    Err(RecvError::Closed) => return Err(BusError::closed("bus")),
                },
                _ = &mut deadline => {
                    debug!(port = self.port, chunks = self.chunks.len(), "pipe read timed out");
                    return Err(BusError::PipeTimeout {
                        duration: timeout,
                        partial: std::mem::take(&mut self.chunks),
                    });
                }
            }
        }
    }

    /// Take one packet. Returns `true` once the pipe is finished.
    fn accept(&mut self, pkt: &Packet) -> bool {
        if pkt.pipe_port() != Some(self.port) {
            return false;
        }
        let counter = pkt.pipe_counter().unwrap_or_default();
        if counter != self.next_counter {
            trace!(port = self.port, counter, expected = self.next_counter, "out of order pipe packet");
            return false;
        }
        self.next_counter = (self.next_counter + 1) & PIPE_COUNTER_MASK;

        let data = pkt.data().to_vec();
        if pkt.is_pipe_meta() {
            self.meta.push(data);
            return pkt.is_pipe_close();
        }
        let empty = data.is_empty();
        if !empty {
            self.chunks.push(data);
        }
        empty || pkt.is_pipe_close()
    }
}

/// Build the pipe packet carrying `data` as chunk `counter` of `port`, addressed to `device`.
pub(crate) fn pipe_packet(
    device: DeviceId,
    port: u16,
    counter: u16,
    flags: u16,
    data: &[u8],
) -> Result<Packet> {
    let command = (port << PIPE_PORT_SHIFT) | flags | (counter & PIPE_COUNTER_MASK);
    Ok(Packet::from_command(command, data)?.into_command(device, SERVICE_INDEX_PIPE))
}

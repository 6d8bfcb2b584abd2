//! Events: occurrence counters for event codes of a service.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;

use super::{EventPath, ServiceHandle};
use crate::bus::{Bus, BusEvent};
use crate::packet::Packet;

#[derive(Debug, Clone)]
pub struct EventNode {
    code: u8,
    count: u64,
    last_timestamp: Option<f64>,
    last_data: Option<Arc<[u8]>>,
}

impl EventNode {
    pub(crate) fn new(code: u8) -> Self {
        Self { code, count: 0, last_timestamp: None, last_data: None }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    pub fn last_data(&self) -> Option<&Arc<[u8]>> {
        self.last_data.as_ref()
    }

    pub(crate) fn process_event(&mut self, path: EventPath, pkt: &Packet, out: &mut Vec<BusEvent>) {
        self.count += 1;
        self.last_timestamp = Some(pkt.timestamp());
        self.last_data = Some(pkt.data().clone());
        out.push(BusEvent::EventNotify { path, packet: pkt.clone() });
    }
}

#[derive(Debug, Clone)]
pub struct EventHandle {
    bus: Bus,
    path: EventPath,
}

impl EventHandle {
    pub(crate) fn new(bus: Bus, path: EventPath) -> Self {
        Self { bus, path }
    }

    pub fn path(&self) -> EventPath {
        self.path
    }

    pub fn code(&self) -> u8 {
        self.path.code
    }

    pub fn service(&self) -> ServiceHandle {
        ServiceHandle::new(self.bus.clone(), self.path.service())
    }

    fn read<R>(&self, f: impl FnOnce(&EventNode) -> R) -> Option<R> {
        self.bus.read_state(|state| state.event(self.path).map(f))
    }

    pub fn count(&self) -> u64 {
        self.read(|e| e.count()).unwrap_or(0)
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.read(|e| e.last_timestamp()).flatten()
    }

    pub fn last_data(&self) -> Option<Arc<[u8]>> {
        self.read(|e| e.last_data().cloned()).flatten()
    }

    /// Stream of event packets, one per de-duplicated occurrence.
    pub fn notifications(&self) -> impl Stream<Item = Packet> + Send + 'static {
        let path = self.path;
        BroadcastStream::new(self.bus.subscribe()).filter_map(move |event| async move {
            match event {
                Ok(BusEvent::EventNotify { path: p, packet }) if p == path => Some(packet),
                _ => None,
            }
        })
    }
}

//! The device graph arena and inbound packet dispatch.
//!
//! Dispatch is a pure state transition: it mutates the arena and appends the events
//! it caused to an output buffer. The [`Bus`](super::Bus) broadcasts them afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::BusEvent;
use crate::catalog::SpecificationCatalog;
use crate::node::{DeviceNode, EventNode, EventPath, RegisterNode, RegisterPath, ServiceNode, ServicePath};
use crate::packet::{DeviceId, Packet};

/// Counters describing inbound traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub frames: u64,
    pub packets: u64,
    pub malformed_frames: u64,
    pub unroutable: u64,
    pub duplicate_events: u64,
    pub sent: u64,
}

/// Arena of devices, services, registers and events.
#[derive(Debug, Clone)]
pub struct BusState {
    pub devices: BTreeMap<DeviceId, DeviceNode>,
    self_id: DeviceId,
    catalog: Arc<SpecificationCatalog>,
    pub(crate) stats: BusStats,
}

impl BusState {
    pub(crate) fn new(self_id: DeviceId, catalog: Arc<SpecificationCatalog>) -> Self {
        Self { devices: BTreeMap::new(), self_id, catalog, stats: BusStats::default() }
    }

    pub fn self_id(&self) -> DeviceId {
        self.self_id
    }

    pub fn catalog(&self) -> &SpecificationCatalog {
        &self.catalog
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceNode> {
        self.devices.get(&id)
    }

    pub fn service(&self, path: ServicePath) -> Option<&ServiceNode> {
        self.devices.get(&path.device)?.service(path.index)
    }

    pub fn service_mut(&mut self, path: ServicePath) -> Option<&mut ServiceNode> {
        self.devices.get_mut(&path.device)?.service_mut(path.index)
    }

    pub fn register(&self, path: RegisterPath) -> Option<&RegisterNode> {
        self.service(path.service())?.register(path.code)
    }

    pub fn event(&self, path: EventPath) -> Option<&EventNode> {
        self.service(path.service())?.event(path.code)
    }

    /// Route one inbound packet through the graph.
    pub fn process_packet(&mut self, pkt: &Packet, now: f64, out: &mut Vec<BusEvent>) {
        self.stats.packets += 1;
        out.push(BusEvent::PacketReceive(pkt.clone()));

        if pkt.is_multi_command() {
            out.push(BusEvent::PacketProcess(pkt.clone()));
            return;
        }
        if pkt.is_command() {
            if pkt.device_id() == self.self_id {
                out.push(BusEvent::SelfCommand(pkt.clone()));
            } else {
                out.push(BusEvent::PacketProcess(pkt.clone()));
            }
            return;
        }
        if pkt.device_id() == self.self_id {
            trace!("ignoring report from self");
            return;
        }
        if pkt.is_crc_ack() {
            self.touch(pkt.device_id(), now, out);
            out.push(BusEvent::CrcAck { device: pkt.device_id(), crc: pkt.service_command() });
            return;
        }
        if pkt.is_announce() {
            self.process_announce(pkt, now, out);
            out.push(BusEvent::PacketProcess(pkt.clone()));
            return;
        }
        if self.process_report(pkt, now, out) {
            out.push(BusEvent::PacketProcess(pkt.clone()));
        } else {
            self.stats.unroutable += 1;
            debug!(packet = %pkt, "unroutable packet dropped");
        }
    }

    fn process_announce(&mut self, pkt: &Packet, now: f64, out: &mut Vec<BusEvent>) {
        let id = pkt.device_id();
        let first = !self.devices.contains_key(&id);
        if first {
            debug!(device = %id, "device connected");
            self.devices.insert(id, DeviceNode::new(id, now));
            out.push(BusEvent::DeviceConnect(id));
        }
        self.touch(id, now, out);
        if let Some(device) = self.devices.get_mut(&id) {
            device.process_announce(pkt, first, &self.catalog, out);
        }
    }

    /// Apply a non-announce report. Returns `false` when nothing in the graph takes it.
    fn process_report(&mut self, pkt: &Packet, now: f64, out: &mut Vec<BusEvent>) -> bool {
        let id = pkt.device_id();
        if !self.devices.contains_key(&id) {
            return false;
        }
        self.touch(id, now, out);
        let Some(device) = self.devices.get_mut(&id) else { return false };
        let index = pkt.service_index();
        if device.service(index).is_none() {
            return false;
        }

        if let (Some(code), Some(counter)) = (pkt.event_code(), pkt.event_counter()) {
            if !device.accept_event_counter(counter) {
                trace!(device = %id, counter, "duplicate event");
                self.stats.duplicate_events += 1;
                return true;
            }
            let path = EventPath { device: id, index, code };
            if let Some(service) = device.service_mut(index) {
                service.event_entry(code).process_event(path, pkt, out);
            }
            return true;
        }

        if let Some(code) = pkt.register_code().filter(|_| pkt.is_register_get()) {
            let path = RegisterPath { device: id, index, code };
            if let Some(service) = device.service_mut(index) {
                service.register_entry(code).process_report(path, pkt, out);
            }
        }
        true
    }

    /// Refresh liveness of a device that just spoke.
    fn touch(&mut self, id: DeviceId, now: f64, out: &mut Vec<BusEvent>) {
        if let Some(device) = self.devices.get_mut(&id) {
            device.last_seen = now;
            if device.lost {
                device.lost = false;
                out.push(BusEvent::DeviceFound(id));
            }
        }
    }

    /// Mark silent devices lost and remove the ones silent for too long.
    pub(crate) fn collect_garbage(
        &mut self,
        now: f64,
        lost_delay_ms: f64,
        disconnect_delay_ms: f64,
        out: &mut Vec<BusEvent>,
    ) {
        let mut removed = Vec::new();
        for (id, device) in self.devices.iter_mut() {
            let silence = now - device.last_seen;
            if silence > disconnect_delay_ms {
                removed.push(*id);
            } else if silence > lost_delay_ms && !device.lost {
                device.lost = true;
                debug!(device = %id, silence, "device lost");
                out.push(BusEvent::DeviceLost(*id));
            }
        }
        for id in removed {
            self.devices.remove(&id);
            debug!(device = %id, "device disconnected");
            out.push(BusEvent::DeviceDisconnect(id));
        }
    }

    /// Paths of services matching `filter`, in device then index order.
    pub fn service_paths(&self, filter: &crate::node::ServiceFilter) -> Vec<ServicePath> {
        self.devices
            .values()
            .flat_map(|d| d.services().iter().map(move |s| (d.id(), s)))
            .filter(|(_, s)| filter.matches(s))
            .map(|(device, s)| ServicePath { device, index: s.index() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;
    use crate::packet::DeviceId;

    const SELF: DeviceId = DeviceId::new([0xaa; 8]);
    const DEV: DeviceId = DeviceId::new([0x01; 8]);

    fn state() -> BusState {
        BusState::new(SELF, Arc::new(SpecificationCatalog::builtin()))
    }

    fn announce(flags: u16) -> Packet {
        Packet::announce(DEV, flags, &[SRV_BUTTON]).unwrap()
    }

    fn event(counter: u8) -> Packet {
        let cmd = CMD_EVENT_MASK | ((counter as u16) << CMD_EVENT_COUNTER_POS) | EVT_BUTTON_DOWN as u16;
        Packet::only_header(cmd).into_report(DEV, 1)
    }

    #[test]
    fn first_announce_connects_device() {
        let mut st = state();
        let mut out = Vec::new();
        st.process_packet(&announce(1), 0.0, &mut out);
        assert!(matches!(
            out[..],
            [
                BusEvent::PacketReceive(_),
                BusEvent::DeviceConnect(_),
                BusEvent::DeviceAnnounce(_),
                BusEvent::PacketProcess(_)
            ]
        ));
        assert_eq!(st.device(DEV).unwrap().services().len(), 2);
    }

    #[test]
    fn report_from_unknown_device_is_unroutable() {
        let mut st = state();
        let mut out = Vec::new();
        let pkt = Packet::register_report(DEV, 1, REG_READING, &[1]).unwrap();
        st.process_packet(&pkt, 0.0, &mut out);
        assert_eq!(st.stats().unroutable, 1);
        assert_eq!(out.len(), 1);

        st.process_packet(&announce(1), 0.0, &mut out);
        let bad_index = Packet::register_report(DEV, 9, REG_READING, &[1]).unwrap();
        st.process_packet(&bad_index, 0.0, &mut out);
        assert_eq!(st.stats().unroutable, 2);
    }

    #[test]
    fn register_report_lands_in_graph() {
        let mut st = state();
        let mut out = Vec::new();
        st.process_packet(&announce(1), 0.0, &mut out);
        out.clear();
        let pkt = Packet::register_report(DEV, 1, REG_READING, &[1, 0]).unwrap();
        st.process_packet(&pkt, 5.0, &mut out);

        let path = RegisterPath { device: DEV, index: 1, code: REG_READING };
        assert_eq!(st.register(path).unwrap().data().map(|d| d.to_vec()), Some(vec![1, 0]));
        assert!(out.iter().any(|e| matches!(e, BusEvent::ReportUpdate { .. })));
    }

    #[test]
    fn retransmitted_events_count_once() {
        let mut st = state();
        let mut out = Vec::new();
        st.process_packet(&announce(1), 0.0, &mut out);
        for _ in 0..3 {
            st.process_packet(&event(4), 1.0, &mut out);
        }
        let path = EventPath { device: DEV, index: 1, code: EVT_BUTTON_DOWN };
        assert_eq!(st.event(path).unwrap().count(), 1);
        assert_eq!(st.stats().duplicate_events, 2);
        assert_eq!(out.iter().filter(|e| matches!(e, BusEvent::EventNotify { .. })).count(), 1);
    }

    #[test]
    fn commands_split_between_self_and_sniffed() {
        let mut st = state();
        let mut out = Vec::new();
        let to_self = Packet::only_header(0x80).into_command(SELF, 0x3e);
        let to_other = Packet::only_header(0x80).into_command(DEV, 1);
        st.process_packet(&to_self, 0.0, &mut out);
        st.process_packet(&to_other, 0.0, &mut out);
        assert!(matches!(out[1], BusEvent::SelfCommand(_)));
        assert!(matches!(out[3], BusEvent::PacketProcess(_)));
    }

    #[test]
    fn garbage_collection_loses_then_removes() {
        let mut st = state();
        let mut out = Vec::new();
        st.process_packet(&announce(1), 0.0, &mut out);
        out.clear();

        st.collect_garbage(1000.0, 1500.0, 3000.0, &mut out);
        assert!(out.is_empty());
        st.collect_garbage(1600.0, 1500.0, 3000.0, &mut out);
        assert!(matches!(out[..], [BusEvent::DeviceLost(_)]));
        assert!(st.device(DEV).unwrap().is_lost());

        out.clear();
        st.process_packet(&announce(1), 1700.0, &mut out);
        assert!(out.iter().any(|e| matches!(e, BusEvent::DeviceFound(_))));

        out.clear();
        st.collect_garbage(4800.0, 1500.0, 3000.0, &mut out);
        assert!(matches!(out[..], [BusEvent::DeviceDisconnect(_)]));
        assert!(st.device(DEV).is_none());
    }
}

//! Devices: announce processing, event de-duplication and the device handle.

use tracing::{debug, warn};

use super::{ServiceHandle, ServiceNode, ServicePath};
use crate::bus::{Bus, BusEvent};
use crate::catalog::SpecificationCatalog;
use crate::constants::*;
use crate::packet::{DeviceId, Packet};
use crate::util::{read_u16_le, read_u32_le};

/// Flags carried by a control announce report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnnounceInfo {
    pub flags: u16,
    pub packet_count: u8,
}

impl AnnounceInfo {
    /// Parse an announce payload into its flags and announced service classes.
    pub fn parse(data: &[u8]) -> Option<(Self, Vec<u32>)> {
        let flags = read_u16_le(data, 0)?;
        let packet_count = data.get(2).copied().unwrap_or(0);
        let classes = (4..data.len()).step_by(4).filter_map(|off| read_u32_le(data, off)).collect();
        Some((Self { flags, packet_count }, classes))
    }

    /// Restart counter; it only moves backwards when the device rebooted.
    pub fn restart_counter(&self) -> u16 {
        self.flags & ANNOUNCE_RESTART_COUNTER_MASK
    }

    pub fn supports_ack(&self) -> bool {
        self.flags & ANNOUNCE_SUPPORTS_ACK != 0
    }

    pub fn supports_broadcast(&self) -> bool {
        self.flags & ANNOUNCE_SUPPORTS_BROADCAST != 0
    }

    pub fn supports_frames(&self) -> bool {
        self.flags & ANNOUNCE_SUPPORTS_FRAMES != 0
    }

    pub fn is_client(&self) -> bool {
        self.flags & ANNOUNCE_IS_CLIENT != 0
    }
}

/// Device state held in the arena.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    id: DeviceId,
    short_id: String,
    announce: AnnounceInfo,
    service_classes: Vec<u32>,
    services: Vec<ServiceNode>,
    first_seen: f64,
    pub(crate) last_seen: f64,
    pub(crate) lost: bool,
    event_counter: Option<u8>,
}

impl DeviceNode {
    pub(crate) fn new(id: DeviceId, now: f64) -> Self {
        Self {
            id,
            short_id: id.short_id(),
            announce: AnnounceInfo::default(),
            service_classes: Vec::new(),
            services: Vec::new(),
            first_seen: now,
            last_seen: now,
            lost: false,
            event_counter: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn announce(&self) -> AnnounceInfo {
        self.announce
    }

    /// Announced classes, control service excluded.
    pub fn service_classes(&self) -> &[u32] {
        &self.service_classes
    }

    pub fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    pub fn service(&self, index: u8) -> Option<&ServiceNode> {
        self.services.get(index as usize)
    }

    pub(crate) fn service_mut(&mut self, index: u8) -> Option<&mut ServiceNode> {
        self.services.get_mut(index as usize)
    }

    pub(crate) fn services_mut(&mut self) -> impl Iterator<Item = &mut ServiceNode> {
        self.services.iter_mut()
    }

    pub fn first_seen(&self) -> f64 {
        self.first_seen
    }

    pub fn last_seen(&self) -> f64 {
        self.last_seen
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Apply an announce report. `first` is set for the announce that created the node.
    pub(crate) fn process_announce(
        &mut self,
        pkt: &Packet,
        first: bool,
        catalog: &SpecificationCatalog,
        out: &mut Vec<BusEvent>,
    ) {
        let Some((info, classes)) = AnnounceInfo::parse(pkt.data()) else {
            warn!(device = %self.id, len = pkt.size(), "announce payload too short");
            return;
        };

        let restarted = !first && info.restart_counter() < self.announce.restart_counter();
        let changed = first || classes != self.service_classes;
        if restarted {
            debug!(device = %self.id, "device restarted");
            self.event_counter = None;
            out.push(BusEvent::DeviceRestart(self.id));
        }
        if changed || restarted {
            self.rebuild_services(&classes, restarted, catalog);
        }
        if changed && !first {
            out.push(BusEvent::DeviceChange(self.id));
        }

        self.announce = info;
        self.service_classes = classes;
        out.push(BusEvent::DeviceAnnounce(self.id));
    }

    fn rebuild_services(&mut self, classes: &[u32], restarted: bool, catalog: &SpecificationCatalog) {
        let mut previous: Vec<Option<ServiceNode>> =
            std::mem::take(&mut self.services).into_iter().map(Some).collect();
        self.services = std::iter::once(SRV_CONTROL)
            .chain(classes.iter().copied())
            .enumerate()
            .map(|(index, class)| {
                let mut node = ServiceNode::new(index as u8, class, catalog);
                if !restarted {
                    if let Some(old) = previous.get_mut(index).and_then(Option::take) {
                        node.inherit(old);
                    }
                }
                node
            })
            .collect();
    }

    /// Decide whether an event with `counter` is new.
    ///
    /// Devices retransmit events with the same counter. Duplicates and recent past
    /// counters are dropped, as are small jumps ahead, which are left to the
    /// retransmission of the missed events. A large jump resynchronises.
    pub(crate) fn accept_event_counter(&mut self, counter: u8) -> bool {
        let mask = CMD_EVENT_COUNTER_MASK;
        let expected = match self.event_counter {
            Some(ec) => ec.wrapping_add(1) & mask,
            None => counter,
        };
        let ahead = counter.wrapping_sub(expected) & mask;
        let behind = expected.wrapping_sub(counter) & mask;
        if ahead > 0 && (behind < 60 || ahead < 5) {
            return false;
        }
        self.event_counter = Some(counter);
        true
    }
}

/// Handle to a device on the bus.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    bus: Bus,
    id: DeviceId,
}

impl DeviceHandle {
    pub(crate) fn new(bus: Bus, id: DeviceId) -> Self {
        Self { bus, id }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn short_id(&self) -> String {
        self.id.short_id()
    }

    fn read<R>(&self, f: impl FnOnce(&DeviceNode) -> R) -> Option<R> {
        self.bus.read_state(|state| state.devices.get(&self.id).map(f))
    }

    /// Whether the device is still in the graph.
    pub fn exists(&self) -> bool {
        self.read(|_| ()).is_some()
    }

    pub fn is_lost(&self) -> bool {
        self.read(|d| d.is_lost()).unwrap_or(true)
    }

    pub fn last_seen(&self) -> Option<f64> {
        self.read(|d| d.last_seen())
    }

    pub fn announce(&self) -> Option<AnnounceInfo> {
        self.read(|d| d.announce())
    }

    pub fn supports_ack(&self) -> bool {
        self.announce().is_some_and(|a| a.supports_ack())
    }

    pub fn service_classes(&self) -> Vec<u32> {
        self.read(|d| d.service_classes().to_vec()).unwrap_or_default()
    }

    pub fn services(&self) -> Vec<ServiceHandle> {
        let count = self.read(|d| d.services().len()).unwrap_or(0);
        (0..count)
            .map(|index| ServiceHandle::new(self.bus.clone(), ServicePath { device: self.id, index: index as u8 }))
            .collect()
    }

    pub fn service(&self, index: u8) -> Option<ServiceHandle> {
        self.read(|d| d.service(index).is_some())
            .filter(|&present| present)
            .map(|_| ServiceHandle::new(self.bus.clone(), ServicePath { device: self.id, index }))
    }

    pub fn services_of_class(&self, service_class: u32) -> Vec<ServiceHandle> {
        self.read(|d| {
            d.services()
                .iter()
                .filter(|s| s.service_class() == service_class)
                .map(|s| s.index())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter()
        .map(|index| ServiceHandle::new(self.bus.clone(), ServicePath { device: self.id, index }))
        .collect()
    }

    /// Human name from the bus name store.
    pub fn name(&self) -> Option<String> {
        self.bus.names().name(self.id)
    }

    pub fn set_name(&self, name: Option<&str>) {
        self.bus.names().set_name(self.id, name.map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(flags: u16, classes: &[u32]) -> Packet {
        Packet::announce(DeviceId::new([2; 8]), flags, classes).unwrap()
    }

    #[test]
    fn parses_announce_payload() {
        let pkt = announce(ANNOUNCE_SUPPORTS_ACK | 3, &[SRV_BUTTON, SRV_LED]);
        let (info, classes) = AnnounceInfo::parse(pkt.data()).unwrap();
        assert_eq!(info.restart_counter(), 3);
        assert!(info.supports_ack());
        assert!(!info.is_client());
        assert_eq!(classes, vec![SRV_BUTTON, SRV_LED]);
        assert!(AnnounceInfo::parse(&[1]).is_none());
    }

    #[test]
    fn announce_builds_services_and_detects_changes() {
        let catalog = SpecificationCatalog::builtin();
        let mut node = DeviceNode::new(DeviceId::new([2; 8]), 0.0);
        let mut out = Vec::new();

        node.process_announce(&announce(1, &[SRV_BUTTON]), true, &catalog, &mut out);
        assert_eq!(node.services().len(), 2);
        assert_eq!(node.service(0).unwrap().service_class(), SRV_CONTROL);
        assert_eq!(node.service(1).unwrap().service_class(), SRV_BUTTON);
        assert!(matches!(out[..], [BusEvent::DeviceAnnounce(_)]));

        out.clear();
        node.process_announce(&announce(2, &[SRV_BUTTON]), false, &catalog, &mut out);
        assert!(matches!(out[..], [BusEvent::DeviceAnnounce(_)]));

        out.clear();
        node.process_announce(&announce(2, &[SRV_BUTTON, SRV_LED]), false, &catalog, &mut out);
        assert!(matches!(out[..], [BusEvent::DeviceChange(_), BusEvent::DeviceAnnounce(_)]));
        assert_eq!(node.services().len(), 3);

        out.clear();
        node.process_announce(&announce(1, &[SRV_BUTTON, SRV_LED]), false, &catalog, &mut out);
        assert!(matches!(out[..], [BusEvent::DeviceRestart(_), BusEvent::DeviceAnnounce(_)]));
    }

    #[test]
    fn event_counter_drops_retransmissions() {
        let mut node = DeviceNode::new(DeviceId::new([2; 8]), 0.0);
        assert!(node.accept_event_counter(10));
        assert!(!node.accept_event_counter(10));
        assert!(!node.accept_event_counter(10));
        assert!(node.accept_event_counter(11));
        assert!(!node.accept_event_counter(9));
    }

    #[test]
    fn event_counter_waits_for_small_gaps_and_resyncs_on_large_ones() {
        let mut node = DeviceNode::new(DeviceId::new([2; 8]), 0.0);
        assert!(node.accept_event_counter(0));
        assert!(!node.accept_event_counter(3));
        assert!(node.accept_event_counter(1));
        // 98 ahead is also 30 behind: treated as stale.
        assert!(!node.accept_event_counter(100));
        assert!(node.accept_event_counter(20));
        assert!(node.accept_event_counter(21));
    }

    #[test]
    fn event_counter_wraps() {
        let mut node = DeviceNode::new(DeviceId::new([2; 8]), 0.0);
        assert!(node.accept_event_counter(0x7f));
        assert!(node.accept_event_counter(0));
        assert!(!node.accept_event_counter(0x7f));
    }
}

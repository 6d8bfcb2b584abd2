//! Services: one numbered service instance on a device.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{DeviceHandle, EventHandle, EventNode, RegisterHandle, RegisterNode, ServicePath};
use crate::bus::Bus;
use crate::catalog::{RegisterKind, ServiceSpec, SpecificationCatalog};
use crate::packet::Packet;
use crate::Result;

/// Service state held in the arena.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    index: u8,
    service_class: u32,
    specification: Option<Arc<ServiceSpec>>,
    infrastructure: bool,
    pub(crate) role: Option<String>,
    registers: BTreeMap<u16, RegisterNode>,
    events: BTreeMap<u8, EventNode>,
}

impl ServiceNode {
    /// Attach a service, resolving its specification once.
    pub(crate) fn new(index: u8, service_class: u32, catalog: &SpecificationCatalog) -> Self {
        Self {
            index,
            service_class,
            specification: catalog.lookup(service_class),
            infrastructure: catalog.is_infrastructure(service_class),
            role: None,
            registers: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn service_class(&self) -> u32 {
        self.service_class
    }

    pub fn specification(&self) -> Option<&Arc<ServiceSpec>> {
        self.specification.as_ref()
    }

    pub fn is_infrastructure(&self) -> bool {
        self.infrastructure
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn register(&self, code: u16) -> Option<&RegisterNode> {
        self.registers.get(&code)
    }

    pub fn registers(&self) -> impl Iterator<Item = &RegisterNode> {
        self.registers.values()
    }

    pub fn event(&self, code: u8) -> Option<&EventNode> {
        self.events.get(&code)
    }

    pub fn events(&self) -> impl Iterator<Item = &EventNode> {
        self.events.values()
    }

    /// Register node for `code`, created with its cached classification on first use.
    pub(crate) fn register_entry(&mut self, code: u16) -> &mut RegisterNode {
        let spec = self.specification.clone();
        self.registers.entry(code).or_insert_with(|| {
            let (kind, reading) = match &spec {
                Some(spec) => (spec.register_kind(code), spec.is_reading(code)),
                None => (RegisterKind::from_code(code), false),
            };
            RegisterNode::new(code, kind, reading)
        })
    }

    pub(crate) fn event_entry(&mut self, code: u8) -> &mut EventNode {
        self.events.entry(code).or_insert_with(|| EventNode::new(code))
    }

    /// Move register and event state over from the node this one replaces.
    pub(crate) fn inherit(&mut self, previous: ServiceNode) {
        if previous.service_class == self.service_class {
            self.role = previous.role;
            self.registers = previous.registers;
            self.events = previous.events;
        }
    }
}

/// Selects services across the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    pub service_class: Option<u32>,
    pub ignore_infrastructure: bool,
    pub role: Option<String>,
}

impl ServiceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn class(service_class: u32) -> Self {
        Self { service_class: Some(service_class), ..Self::default() }
    }

    pub fn ignore_infrastructure(mut self) -> Self {
        self.ignore_infrastructure = true;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn matches(&self, node: &ServiceNode) -> bool {
        self.service_class.is_none_or(|c| c == node.service_class)
            && !(self.ignore_infrastructure && node.infrastructure)
            && self.role.as_deref().is_none_or(|r| node.role() == Some(r))
    }
}

/// Handle to one service of a device.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    bus: Bus,
    path: ServicePath,
}

impl ServiceHandle {
    pub(crate) fn new(bus: Bus, path: ServicePath) -> Self {
        Self { bus, path }
    }

    pub fn path(&self) -> ServicePath {
        self.path
    }

    pub fn index(&self) -> u8 {
        self.path.index
    }

    pub fn device(&self) -> DeviceHandle {
        DeviceHandle::new(self.bus.clone(), self.path.device)
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    fn read<R>(&self, f: impl FnOnce(&ServiceNode) -> R) -> Option<R> {
        self.bus.read_state(|state| state.service(self.path).map(f))
    }

    pub fn exists(&self) -> bool {
        self.read(|_| ()).is_some()
    }

    pub fn service_class(&self) -> Option<u32> {
        self.read(|s| s.service_class())
    }

    pub fn specification(&self) -> Option<Arc<ServiceSpec>> {
        self.read(|s| s.specification().cloned()).flatten()
    }

    pub fn is_infrastructure(&self) -> bool {
        self.read(|s| s.is_infrastructure()).unwrap_or(false)
    }

    /// Role name bound by the role manager.
    pub fn role(&self) -> Option<String> {
        self.read(|s| s.role.clone()).flatten()
    }

    /// Register `code`, created on first access. `None` once the service is gone.
    pub fn register(&self, code: u16) -> Option<RegisterHandle> {
        let path = self.path.register(code);
        self.bus
            .write_state(|state| state.service_mut(self.path).map(|s| s.register_entry(code).code()))
            .map(|_| RegisterHandle::new(self.bus.clone(), path))
    }

    /// Registers that have been accessed or reported so far.
    pub fn registers(&self) -> Vec<RegisterHandle> {
        self.read(|s| s.registers().map(|r| r.code()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .map(|code| RegisterHandle::new(self.bus.clone(), self.path.register(code)))
            .collect()
    }

    /// Event `code`, created on first access.
    pub fn event(&self, code: u8) -> Option<EventHandle> {
        let path = self.path.event(code);
        self.bus
            .write_state(|state| state.service_mut(self.path).map(|s| s.event_entry(code).code()))
            .map(|_| EventHandle::new(self.bus.clone(), path))
    }

    /// Address `pkt` to this service and send it.
    pub async fn send_packet(&self, pkt: Packet, with_ack: bool) -> Result<()> {
        let pkt = pkt.into_command(self.path.device, self.path.index);
        if with_ack {
            self.bus.send_packet_with_ack(pkt).await
        } else {
            self.bus.send_packet(pkt).await
        }
    }

    pub async fn send_command(&self, command: u16, data: &[u8], with_ack: bool) -> Result<()> {
        self.send_packet(Packet::from_command(command, data)?, with_ack).await
    }
}

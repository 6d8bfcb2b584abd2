//! Simulated devices living directly on a bus.
//!
//! A simulated device injects its reports through [`Bus::process_packet`] and reacts to
//! the commands the host sends to its id, which it observes as
//! [`BusEvent::PacketSend`]. It needs no transport, so the same code backs role
//! auto-provisioning and the test harness.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, BusEvent, WeakBus};
use crate::constants::*;
use crate::node::ServicePath;
use crate::packet::{DeviceId, Packet};
use crate::pipe::pipe_packet;
use crate::role_manager::Role;
use crate::Result;

/// Announce period of simulated devices.
pub const SIMULATOR_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// One service of a simulated device: a class plus a register file.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedService {
    service_class: u32,
    registers: BTreeMap<u16, Vec<u8>>,
    roles: Option<Vec<Role>>,
}

impl SimulatedService {
    pub fn new(service_class: u32) -> Self {
        Self { service_class, registers: BTreeMap::new(), roles: None }
    }

    pub fn with_register(mut self, code: u16, value: impl Into<Vec<u8>>) -> Self {
        self.registers.insert(code, value.into());
        self
    }

    pub fn control() -> Self {
        Self::new(SRV_CONTROL)
            .with_register(REG_CTRL_PRODUCT_IDENTIFIER, 0x3f6a_1c2du32.to_le_bytes())
            .with_register(REG_CTRL_FIRMWARE_VERSION, b"sim".to_vec())
            .with_register(REG_CTRL_DEVICE_DESCRIPTION, b"simulated device".to_vec())
    }

    pub fn button() -> Self {
        Self::new(SRV_BUTTON).with_register(REG_READING, 0u16.to_le_bytes())
    }

    pub fn potentiometer() -> Self {
        Self::new(SRV_POTENTIOMETER).with_register(REG_READING, 0u16.to_le_bytes())
    }

    pub fn led() -> Self {
        Self::new(SRV_LED)
            .with_register(REG_INTENSITY, vec![0xff])
            .with_register(REG_VALUE, vec![0, 0, 0])
    }

    /// Role manager holding `roles`. Unbound roles carry the zero device id.
    pub fn role_manager(roles: Vec<Role>) -> Self {
        Self {
            roles: Some(roles),
            ..Self::new(SRV_ROLE_MANAGER).with_register(REG_ROLE_MANAGER_AUTO_BIND, vec![1])
        }
    }

    pub fn service_class(&self) -> u32 {
        self.service_class
    }

    pub fn register(&self, code: u16) -> Option<&[u8]> {
        self.registers.get(&code).map(Vec::as_slice)
    }

    pub fn roles(&self) -> Option<&[Role]> {
        self.roles.as_deref()
    }
}

struct SimShared {
    id: DeviceId,
    services: Mutex<Vec<SimulatedService>>,
    announces: AtomicU16,
    event_counter: AtomicU8,
    muted: AtomicBool,
}

impl SimShared {
    fn announce_packet(&self) -> Result<Packet> {
        let count = self.announces.fetch_add(1, Ordering::Relaxed);
        let flags = count.saturating_add(1).min(ANNOUNCE_RESTART_COUNTER_MASK) | ANNOUNCE_SUPPORTS_ACK;
        let classes: Vec<u32> =
            self.services.lock().iter().skip(1).map(|s| s.service_class).collect();
        Packet::announce(self.id, flags, &classes)
    }

    fn register_report(&self, index: u8, code: u16, now: f64) -> Option<Result<Packet>> {
        let value = match (index, code) {
            (SERVICE_INDEX_CTRL, REG_CTRL_UPTIME) => ((now * 1000.0) as u64).to_le_bytes().to_vec(),
            _ => self.services.lock().get(index as usize)?.registers.get(&code)?.clone(),
        };
        Some(Packet::register_report(self.id, index, code, &value))
    }

    fn event_packets(&self, index: u8, code: u8, data: &[u8]) -> Result<Vec<Packet>> {
        let counter = self.event_counter.fetch_add(1, Ordering::Relaxed) & CMD_EVENT_COUNTER_MASK;
        let command = CMD_EVENT_MASK | ((counter as u16) << CMD_EVENT_COUNTER_POS) | code as u16;
        let pkt = Packet::from_command(command, data)?.into_report(self.id, index);
        // Devices send each event three times with the same counter.
        Ok(vec![pkt.clone_packet(), pkt.clone_packet(), pkt])
    }

    /// Replies to a command addressed to this device.
    fn handle_command(&self, bus: &Bus, pkt: &Packet) -> Result<Vec<Packet>> {
        let mut replies = Vec::new();
        if pkt.requires_ack() {
            replies.push(Packet::crc_ack(self.id, pkt.crc()));
        }
        let index = pkt.service_index();
        if pkt.is_register_get() {
            if let Some(report) = pkt.register_code().and_then(|code| {
                self.register_report(index, code, bus.timestamp())
            }) {
                replies.push(report?);
            }
            return Ok(replies);
        }
        if pkt.is_register_set() {
            if let (Some(code), Some(service)) =
                (pkt.register_code(), self.services.lock().get_mut(index as usize))
            {
                trace!(device = %self.id, index, code, "simulated register set");
                service.registers.insert(code, pkt.data().to_vec());
            }
            return Ok(replies);
        }

        let is_role_manager = self
            .services
            .lock()
            .get(index as usize)
            .is_some_and(|s| s.service_class == SRV_ROLE_MANAGER);
        if is_role_manager {
            replies.extend(self.handle_role_manager(bus, index, pkt)?);
        }
        Ok(replies)
    }

    fn handle_role_manager(&self, bus: &Bus, index: u8, pkt: &Packet) -> Result<Vec<Packet>> {
        match pkt.service_command() {
            CMD_ROLE_MANAGER_LIST_ROLES => {
                let data = pkt.data();
                let Ok(requester) = DeviceId::from_slice(data.get(..8).unwrap_or_default()) else {
                    warn!(device = %self.id, "list roles without pipe token");
                    return Ok(Vec::new());
                };
                let port = data.get(8..10).map(|b| u16::from_le_bytes([b[0], b[1]])).unwrap_or(0);
                let roles = self.roles(index);
                let mut out = Vec::with_capacity(roles.len() + 1);
                for (counter, role) in roles.iter().enumerate() {
                    out.push(pipe_packet(requester, port, counter as u16, 0, &role.pack()?)?);
                }
                out.push(pipe_packet(requester, port, roles.len() as u16, PIPE_CLOSE_MASK, &[])?);
                Ok(out)
            }
            CMD_ROLE_MANAGER_SET_ROLE => {
                let data = pkt.data();
                let (Ok(device), Some(&service_index)) =
                    (DeviceId::from_slice(data.get(..8).unwrap_or_default()), data.get(8))
                else {
                    warn!(device = %self.id, "malformed set role");
                    return Ok(Vec::new());
                };
                let name = String::from_utf8_lossy(data.get(9..).unwrap_or_default()).into_owned();
                let service_class = bus
                    .read_state(|s| {
                        s.service(ServicePath { device, index: service_index }).map(|s| s.service_class())
                    })
                    .unwrap_or_default();
                self.update_roles(index, |roles| bind_role(roles, device, service_index, service_class, &name));
                self.event_packets(index, EVT_CHANGE, &[])
            }
            CMD_ROLE_MANAGER_CLEAR_ALL_ROLES => {
                self.update_roles(index, |roles| {
                    for role in roles.iter_mut() {
                        role.device_id = DeviceId::default();
                        role.service_index = 0;
                    }
                });
                self.event_packets(index, EVT_CHANGE, &[])
            }
            other => {
                debug!(device = %self.id, command = other, "unhandled role manager command");
                Ok(Vec::new())
            }
        }
    }

    fn roles(&self, index: u8) -> Vec<Role> {
        self.services
            .lock()
            .get(index as usize)
            .and_then(|s| s.roles.clone())
            .unwrap_or_default()
    }

    fn update_roles(&self, index: u8, f: impl FnOnce(&mut Vec<Role>)) {
        if let Some(roles) = self.services.lock().get_mut(index as usize).and_then(|s| s.roles.as_mut()) {
            f(roles);
        }
    }
}

/// Apply a set-role request to a role table.
fn bind_role(roles: &mut Vec<Role>, device: DeviceId, service_index: u8, service_class: u32, name: &str) {
    if name.is_empty() {
        for role in roles.iter_mut().filter(|r| r.device_id == device && r.service_index == service_index) {
            role.device_id = DeviceId::default();
            role.service_index = 0;
        }
        return;
    }
    match roles.iter_mut().find(|r| r.name == name) {
        Some(role) => {
            role.device_id = device;
            role.service_index = service_index;
        }
        None => roles.push(Role {
            device_id: device,
            service_class,
            service_index,
            name: name.to_string(),
            query: None,
        }),
    }
}

/// A device simulated on the bus. Stops when dropped.
pub struct SimulatedDevice {
    shared: Arc<SimShared>,
    bus: WeakBus,
    cancel: CancellationToken,
}

impl SimulatedDevice {
    /// Start a device with a random id exposing `services` after its control service.
    pub fn spawn(bus: &Bus, services: Vec<SimulatedService>) -> Self {
        Self::spawn_with_id(bus, DeviceId::random(), services)
    }

    pub fn spawn_with_id(bus: &Bus, id: DeviceId, services: Vec<SimulatedService>) -> Self {
        let shared = Arc::new(SimShared {
            id,
            services: Mutex::new(std::iter::once(SimulatedService::control()).chain(services).collect()),
            announces: AtomicU16::new(0),
            event_counter: AtomicU8::new(0),
            muted: AtomicBool::new(false),
        });
        let device = Self { shared, bus: bus.downgrade(), cancel: CancellationToken::new() };
        device.spawn_task(bus);
        debug!(device = %id, "simulated device started");
        device
    }

    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    /// Service classes after the control service.
    pub fn service_classes(&self) -> Vec<u32> {
        self.shared.services.lock().iter().skip(1).map(|s| s.service_class).collect()
    }

    pub fn register(&self, index: u8, code: u16) -> Option<Vec<u8>> {
        self.shared.services.lock().get(index as usize)?.registers.get(&code).cloned()
    }

    /// Change a register value without reporting it.
    pub fn set_register(&self, index: u8, code: u16, value: impl Into<Vec<u8>>) {
        if let Some(service) = self.shared.services.lock().get_mut(index as usize) {
            service.registers.insert(code, value.into());
        }
    }

    pub fn roles(&self, index: u8) -> Vec<Role> {
        self.shared.roles(index)
    }

    /// Report the current value of a register, as a streaming device would.
    pub fn send_report(&self, index: u8, code: u16) -> Result<()> {
        let Some(bus) = self.bus.upgrade() else { return Ok(()) };
        if let Some(report) = self.shared.register_report(index, code, bus.timestamp()) {
            bus.process_packet(report?);
        }
        Ok(())
    }

    /// Emit an event, including the protocol's retransmissions.
    pub fn send_event(&self, index: u8, code: u8, data: &[u8]) -> Result<()> {
        let Some(bus) = self.bus.upgrade() else { return Ok(()) };
        for pkt in self.shared.event_packets(index, code, data)? {
            bus.process_packet(pkt);
        }
        Ok(())
    }

    /// Announce immediately.
    pub fn announce(&self) -> Result<()> {
        if let Some(bus) = self.bus.upgrade() {
            bus.process_packet(self.shared.announce_packet()?);
        }
        Ok(())
    }

    /// Reset the restart counter, as after a reboot. The next announce reveals it.
    pub fn restart(&self) {
        self.shared.announces.store(0, Ordering::Relaxed);
        self.shared.event_counter.store(0, Ordering::Relaxed);
    }

    /// A muted device neither announces nor answers.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn spawn_task(&self, bus: &Bus) {
        let shared = self.shared.clone();
        let weak = self.bus.clone();
        let cancel = self.cancel.clone();
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SIMULATOR_ANNOUNCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let replies = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if shared.muted.load(Ordering::Relaxed) {
                            continue;
                        }
                        shared.announce_packet().map(|pkt| vec![pkt])
                    }
                    event = events.recv() => match event {
                        Ok(BusEvent::PacketSend(pkt))
                            if pkt.is_command()
                                && !pkt.is_multi_command()
                                && pkt.device_id() == shared.id
                                && !shared.muted.load(Ordering::Relaxed) =>
                        {
                            let Some(bus) = weak.upgrade() else { break };
                            shared.handle_command(&bus, &pkt)
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(device = %shared.id, skipped, "simulator lagged behind bus events");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(bus) = weak.upgrade() else { break };
                match replies {
                    Ok(packets) => packets.into_iter().for_each(|pkt| bus.process_packet(pkt)),
                    Err(e) => warn!(device = %shared.id, error = %e, "simulator reply failed"),
                }
            }
            debug!(device = %shared.id, "simulated device stopped");
        });
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("id", &self.shared.id)
            .field("services", &self.service_classes())
            .finish()
    }
}

/// Source of simulated service providers, keyed by service class.
pub trait ServiceProviderRegistry: Send + Sync {
    /// Provider definition for `service_class`, if one exists.
    fn service(&self, service_class: u32) -> Option<SimulatedService>;

    /// Start a device exposing `services` and keep it running.
    fn add_provider(&self, bus: &Bus, services: Vec<SimulatedService>) -> DeviceId;
}

/// Built-in registry for the button, potentiometer and LED services.
#[derive(Debug, Default)]
pub struct SimulatorRegistry {
    devices: Mutex<Vec<SimulatedDevice>>,
}

impl SimulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the devices started so far.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.lock().iter().map(SimulatedDevice::id).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn stop_all(&self) {
        self.devices.lock().clear();
    }
}

impl ServiceProviderRegistry for SimulatorRegistry {
    fn service(&self, service_class: u32) -> Option<SimulatedService> {
        match service_class {
            SRV_BUTTON => Some(SimulatedService::button()),
            SRV_POTENTIOMETER => Some(SimulatedService::potentiometer()),
            SRV_LED => Some(SimulatedService::led()),
            _ => None,
        }
    }

    fn add_provider(&self, bus: &Bus, services: Vec<SimulatedService>) -> DeviceId {
        let device = SimulatedDevice::spawn(bus, services);
        let id = device.id();
        // Announce right away so the device is bound before the next refresh.
        if let Err(e) = device.announce() {
            warn!(device = %id, error = %e, "initial announce failed");
        }
        self.devices.lock().push(device);
        id
    }
}

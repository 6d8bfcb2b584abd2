//! Role manager client: mirrors a remote role table onto local services.
//!
//! The remote role manager owns the table mapping role names to
//! `(device, service index)` bindings. The client lists it over a pipe, keeps a local
//! copy, and writes each binding onto the matching service's `role`. Refreshes are
//! debounced and retried from the self-announce tick while the last attempt failed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusEvent};
use crate::constants::*;
use crate::node::{ServiceFilter, ServiceHandle};
use crate::packet::DeviceId;
use crate::pipe::InPipeReader;
use crate::scheduler::Debouncer;
use crate::sim::{ServiceProviderRegistry, SimulatedService};
use crate::util::read_u32_le;
use crate::{BusError, Result};

/// One entry of the remote role table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub device_id: DeviceId,
    pub service_class: u32,
    pub service_index: u8,
    pub name: String,
    pub query: Option<String>,
}

impl Role {
    /// Unbound role of `service_class`.
    pub fn unbound(name: impl Into<String>, service_class: u32) -> Self {
        Self {
            device_id: DeviceId::default(),
            service_class,
            service_index: 0,
            name: name.into(),
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Decode `device id [8] | service class u32 | service index u8 | "name?query"`.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        let (Some(id), Some(service_class), Some(&service_index)) =
            (data.get(..8), read_u32_le(data, 8), data.get(12))
        else {
            return Err(BusError::parse("role entry", format!("{} bytes is too short", data.len())));
        };
        let full = String::from_utf8_lossy(&data[13..]);
        let (name, query) = match full.split_once('?') {
            Some((name, query)) => (name.to_string(), Some(query.to_string())),
            None => (full.into_owned(), None),
        };
        Ok(Self { device_id: DeviceId::from_slice(id)?, service_class, service_index, name, query })
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(13 + self.name.len());
        data.extend_from_slice(self.device_id.as_bytes());
        data.extend_from_slice(&self.service_class.to_le_bytes());
        data.push(self.service_index);
        data.extend_from_slice(self.name.as_bytes());
        if let Some(query) = &self.query {
            data.push(b'?');
            data.extend_from_slice(query.as_bytes());
        }
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(BusError::parse("role entry", format!("role {} does not fit a packet", self.name)));
        }
        Ok(data)
    }

    pub fn is_bound(&self) -> bool {
        self.device_id != DeviceId::default()
    }

    /// Name of the device this role should live on when simulated.
    ///
    /// A query `device=<id>` names it directly (`device=self` is the host); otherwise a
    /// `parent/child` role name groups by its prefix. Plain names have no parent.
    pub fn parent_name(&self, self_id: DeviceId) -> Option<String> {
        if let Some(query) = &self.query {
            return query
                .split('&')
                .filter_map(|arg| arg.split_once('='))
                .find(|(key, _)| *key == "device")
                .map(|(_, value)| if value == "self" { self_id.to_string() } else { value.to_string() });
        }
        self.name.split_once('/').map(|(parent, _)| parent.to_string())
    }
}

struct ClientInner {
    bus: Bus,
    service: ServiceHandle,
    roles: RwLock<Vec<Role>>,
    need_refresh: AtomicBool,
    last_refresh_attempt: Mutex<f64>,
    debouncer: Mutex<Option<Debouncer>>,
    cancel: CancellationToken,
}

/// Client bound to one role manager service.
#[derive(Clone)]
pub struct RoleManagerClient {
    inner: Arc<ClientInner>,
}

impl RoleManagerClient {
    /// Bind to `service` and start following its change events.
    pub fn new(service: ServiceHandle) -> Self {
        let bus = service.bus().clone();
        let window = Duration::from_millis(bus.options().role_manager.debounce_ms);
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let job_target = weak.clone();
            let debouncer = Debouncer::new(window, move || {
                let target = job_target.clone();
                async move {
                    if let Some(inner) = target.upgrade() {
                        inner.refresh_roles().await;
                    }
                }
            });
            ClientInner {
                bus,
                service,
                roles: RwLock::new(Vec::new()),
                need_refresh: AtomicBool::new(true),
                last_refresh_attempt: Mutex::new(0.0),
                debouncer: Mutex::new(Some(debouncer)),
                cancel: CancellationToken::new(),
            }
        });
        spawn_listener(&inner);
        info!(service = %inner.service.path(), "role manager client mounted");
        Self { inner }
    }

    /// Client for the first role manager service on the bus.
    pub fn find(bus: &Bus) -> Option<Self> {
        bus.services(&ServiceFilter::class(SRV_ROLE_MANAGER)).into_iter().next().map(Self::new)
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.inner.service
    }

    pub fn roles(&self) -> Vec<Role> {
        self.inner.roles.read().clone()
    }

    /// Role `name` bound to a non-control service.
    pub fn role(&self, name: &str) -> Option<Role> {
        self.inner.roles.read().iter().find(|r| r.service_index > 0 && r.name == name).cloned()
    }

    pub fn compatible_roles(&self, service_class: u32) -> Vec<Role> {
        self.inner.roles.read().iter().filter(|r| r.service_class == service_class).cloned().collect()
    }

    pub fn has_role_for_service(&self, service: &ServiceHandle) -> bool {
        service
            .service_class()
            .is_some_and(|class| self.inner.roles.read().iter().any(|r| r.service_class == class))
    }

    /// Whether every role points at a device currently on the bus.
    pub fn all_roles_bound(&self) -> bool {
        let roles = self.inner.roles.read().clone();
        roles.iter().all(|r| self.inner.bus.device(r.device_id).is_some())
    }

    pub fn needs_refresh(&self) -> bool {
        self.inner.need_refresh.load(Ordering::Relaxed)
    }

    /// Schedule a debounced refresh.
    pub fn start_refresh(&self) {
        self.inner.trigger_refresh();
    }

    /// List the remote table now and reassign roles.
    pub async fn refresh_roles(&self) {
        self.inner.refresh_roles().await;
    }

    /// Bind `name` to `service`, first clearing whichever service held it before.
    pub async fn set_role(&self, service: &ServiceHandle, name: &str) -> Result<()> {
        let path = service.path();
        let previous = (!name.is_empty())
            .then(|| self.inner.roles.read().iter().find(|r| r.name == name).cloned())
            .flatten();

        if let Some(previous) = previous {
            if previous.device_id == path.device && previous.service_index == path.index {
                debug!(name, "role unmodified");
                return Ok(());
            }
            if previous.is_bound() {
                debug!(name, device = %previous.device_id, index = previous.service_index, "clearing previous role holder");
                self.inner.send_set_role(previous.device_id, previous.service_index, "").await?;
            }
        }
        self.inner.send_set_role(path.device, path.index, name).await
    }

    /// Remove whatever role `service` holds.
    pub async fn clear_role(&self, service: &ServiceHandle) -> Result<()> {
        let path = service.path();
        self.inner.send_set_role(path.device, path.index, "").await
    }

    pub async fn clear_all_roles(&self) -> Result<()> {
        let ack = self.inner.service.device().supports_ack();
        self.inner
            .service
            .send_command(CMD_ROLE_MANAGER_CLEAR_ALL_ROLES, &[], ack)
            .await
            .map_err(|e| BusError::role_sync("clear all roles", Some(e)))
    }

    /// Spawn simulated providers for the roles no device on the bus satisfies.
    ///
    /// Roles sharing a parent name land on one multi-service device; roles without a
    /// parent each get their own. Returns the ids of the started devices.
    pub fn start_simulators(&self, registry: &dyn ServiceProviderRegistry) -> Vec<DeviceId> {
        let bus = &self.inner.bus;
        let self_id = bus.self_device_id();
        let mut groups: BTreeMap<Option<String>, Vec<SimulatedService>> = BTreeMap::new();
        for role in self.roles() {
            if bus.device(role.device_id).is_some() {
                continue;
            }
            let Some(service) = registry.service(role.service_class) else {
                debug!(name = %role.name, class = role.service_class, "no simulator for role");
                continue;
            };
            groups.entry(role.parent_name(self_id)).or_default().push(service);
        }

        let mut started = Vec::new();
        for (parent, services) in groups {
            match parent {
                Some(parent) => {
                    debug!(%parent, services = services.len(), "starting grouped simulator");
                    started.push(registry.add_provider(bus, services));
                }
                None => {
                    for service in services {
                        started.push(registry.add_provider(bus, vec![service]));
                    }
                }
            }
        }
        started
    }

    /// Stop following the role manager and clear every assigned role.
    pub fn unmount(&self) {
        self.inner.unmount();
    }
}

impl std::fmt::Debug for RoleManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleManagerClient")
            .field("service", &self.inner.service.path())
            .field("roles", &self.inner.roles.read().len())
            .finish()
    }
}

impl ClientInner {
    fn trigger_refresh(&self) {
        if let Some(debouncer) = self.debouncer.lock().as_ref() {
            debouncer.trigger();
        }
    }

    async fn refresh_roles(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.need_refresh.store(false, Ordering::Relaxed);
        if let Err(e) = self.collect_roles().await {
            warn!(error = %e, "role refresh failed");
            self.need_refresh.store(true, Ordering::Relaxed);
            self.bus.emit(BusEvent::RoleError { reason: e.to_string() });
        }
        if !self.cancel.is_cancelled() {
            self.assign_roles();
        }
    }

    async fn collect_roles(&self) -> Result<()> {
        *self.last_refresh_attempt.lock() = self.bus.timestamp();
        let previous = table_hash(&self.roles.read())?;

        let mut pipe = InPipeReader::new(&self.bus);
        let ack = self.service.device().supports_ack();
        let open = pipe.open_command(CMD_ROLE_MANAGER_LIST_ROLES)?;
        self.service
            .send_packet(open, ack)
            .await
            .map_err(|e| BusError::role_sync("list roles", Some(e)))?;
        let chunks = pipe
            .read_data(self.bus.options().pipe_timeout())
            .await
            .map_err(|e| BusError::role_sync("list roles", Some(e)))?;
        let roles = chunks.iter().map(|chunk| Role::unpack(chunk)).collect::<Result<Vec<_>>>()?;

        if table_hash(&roles)? != previous {
            debug!(count = roles.len(), "role table changed");
            *self.roles.write() = roles;
            self.bus.emit(BusEvent::RoleChange);
        }
        Ok(())
    }

    /// Copy the table onto every non-infrastructure service.
    fn assign_roles(&self) {
        let roles = self.roles.read().clone();
        let changes = self.bus.write_state(|state| {
            let mut changes = Vec::new();
            for device in state.devices.values_mut() {
                let id = device.id();
                for service in device.services_mut().filter(|s| !s.is_infrastructure()) {
                    let role = roles
                        .iter()
                        .find(|r| r.device_id == id && r.service_index == service.index())
                        .map(|r| r.name.clone());
                    if service.role != role {
                        service.role = role.clone();
                        changes.push(BusEvent::ServiceRoleChange {
                            path: crate::node::ServicePath { device: id, index: service.index() },
                            role,
                        });
                    }
                }
            }
            changes
        });
        changes.into_iter().for_each(|event| self.bus.emit(event));
    }

    fn clear_roles(&self) {
        let changes = self.bus.write_state(|state| {
            let mut changes = Vec::new();
            for device in state.devices.values_mut() {
                let id = device.id();
                for service in device.services_mut() {
                    if service.role.take().is_some() {
                        changes.push(BusEvent::ServiceRoleChange {
                            path: crate::node::ServicePath { device: id, index: service.index() },
                            role: None,
                        });
                    }
                }
            }
            changes
        });
        changes.into_iter().for_each(|event| self.bus.emit(event));
    }

    async fn send_set_role(&self, device: DeviceId, service_index: u8, name: &str) -> Result<()> {
        let mut data = Vec::with_capacity(9 + name.len());
        data.extend_from_slice(device.as_bytes());
        data.push(service_index);
        data.extend_from_slice(name.as_bytes());
        let ack = self.service.device().supports_ack();
        self.service
            .send_command(CMD_ROLE_MANAGER_SET_ROLE, &data, ack)
            .await
            .map_err(|e| BusError::role_sync(format!("set role {name:?}"), Some(e)))
    }

    fn handle_self_announce(&self) {
        let poll = self.bus.options().role_manager.poll_interval_ms as f64;
        let elapsed = self.bus.timestamp() - *self.last_refresh_attempt.lock();
        if self.need_refresh.load(Ordering::Relaxed) && elapsed > poll {
            self.trigger_refresh();
        }
    }

    fn unmount(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.debouncer.lock().take();
        self.clear_roles();
        debug!(service = %self.service.path(), "role manager client unmounted");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn table_hash(roles: &[Role]) -> Result<String> {
    serde_json::to_string(roles).map_err(|e| BusError::parse("role table", e.to_string()))
}

fn spawn_listener(inner: &Arc<ClientInner>) {
    let weak = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    let service = inner.service.path();
    let mut events = inner.bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(inner) = weak.upgrade() else { break };
            match event {
                Ok(BusEvent::EventNotify { path, .. })
                    if path.service() == service && path.code == EVT_CHANGE =>
                {
                    inner.trigger_refresh();
                }
                Ok(BusEvent::DeviceAnnounce(_)) => inner.assign_roles(),
                Ok(BusEvent::SelfAnnounce) => inner.handle_self_announce(),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "role manager listener lagged; scheduling refresh");
                    inner.trigger_refresh();
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

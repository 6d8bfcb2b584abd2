//! The bus: transports in, device graph in the middle, events out.
//!
//! ```text
//!  Transport ──frames──► process_frame ──► process_packet ──► BusState ──► BusEvent
//!  Transport ◄──frames── send_packet ◄──── handles, pipes, role manager
//! ```
//!
//! [`Bus`] is a cheap cloneable handle. Background work (self-announce, device
//! garbage collection, transport pumps) holds only a [`WeakBus`], so the engine
//! stops once the last handle is dropped.

mod names;
mod options;
mod state;

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::catalog::SpecificationCatalog;
use crate::constants::*;
use crate::node::{DeviceHandle, EventPath, RegisterPath, ServiceFilter, ServiceHandle, ServicePath};
use crate::packet::{DeviceId, Packet, decode_frames};
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use crate::transport::{ConnectionState, Transport, TransportEvent};
use crate::{BusError, Result};

pub use names::{DeviceNames, MemoryDeviceNames};
pub use options::{AckPolicy, BusOptions, RefreshPolicy, RoleManagerOptions};
pub use state::{BusState, BusStats};

/// Everything observable on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Aggregate connection state changed.
    ConnectionChange(ConnectionState),
    DeviceConnect(DeviceId),
    DeviceAnnounce(DeviceId),
    /// The announced service list changed.
    DeviceChange(DeviceId),
    /// The restart counter went backwards.
    DeviceRestart(DeviceId),
    /// Silent long enough to be considered lost; still in the graph.
    DeviceLost(DeviceId),
    /// A lost device spoke again.
    DeviceFound(DeviceId),
    /// Removed from the graph.
    DeviceDisconnect(DeviceId),
    PacketReceive(Packet),
    PacketProcess(Packet),
    PacketSend(Packet),
    /// Command addressed to the host's own device id.
    SelfCommand(Packet),
    SelfAnnounce,
    CrcAck { device: DeviceId, crc: u16 },
    ReportReceive { path: RegisterPath, packet: Packet },
    ReportUpdate { path: RegisterPath, data: Arc<[u8]> },
    EventNotify { path: EventPath, packet: Packet },
    RoleChange,
    RoleError { reason: String },
    ServiceRoleChange { path: ServicePath, role: Option<String> },
}

struct BusInner {
    options: BusOptions,
    self_id: DeviceId,
    scheduler: TokioScheduler,
    state: Mutex<BusState>,
    events: broadcast::Sender<BusEvent>,
    transports: RwLock<Vec<Arc<Transport>>>,
    names: Arc<dyn DeviceNames>,
    announces: AtomicU16,
    announcer: Mutex<Option<TimerHandle>>,
    cancel: CancellationToken,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        debug!(self_id = %self.self_id, "dropping bus");
        self.cancel.cancel();
        if let Some(timer) = self.announcer.get_mut().take() {
            timer.cancel();
        }
    }
}

/// Handle to a running bus. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

/// Non-owning bus reference held by background tasks.
#[derive(Clone)]
pub struct WeakBus {
    inner: Weak<BusInner>,
}

impl WeakBus {
    pub fn upgrade(&self) -> Option<Bus> {
        self.inner.upgrade().map(|inner| Bus { inner })
    }
}

impl fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBus").field("alive", &(self.inner.strong_count() > 0)).finish()
    }
}

impl Bus {
    /// Bus with the built-in specification catalog and in-memory device names.
    pub fn new(options: BusOptions) -> Result<Self> {
        Self::from_parts(options, SpecificationCatalog::builtin(), Arc::new(MemoryDeviceNames::new()))
    }

    pub fn with_catalog(options: BusOptions, catalog: SpecificationCatalog) -> Result<Self> {
        Self::from_parts(options, catalog, Arc::new(MemoryDeviceNames::new()))
    }

    pub fn from_parts(
        options: BusOptions,
        catalog: SpecificationCatalog,
        names: Arc<dyn DeviceNames>,
    ) -> Result<Self> {
        options.validate()?;
        let self_id = options.self_device_id.unwrap_or_else(DeviceId::random);
        let (events, _) = broadcast::channel(options.event_capacity);
        let bus = Bus {
            inner: Arc::new(BusInner {
                self_id,
                scheduler: TokioScheduler::new(),
                state: Mutex::new(BusState::new(self_id, Arc::new(catalog))),
                events,
                transports: RwLock::new(Vec::new()),
                names,
                announces: AtomicU16::new(0),
                announcer: Mutex::new(None),
                cancel: CancellationToken::new(),
                options,
            }),
        };
        bus.spawn_announcer();
        info!(self_id = %self_id, "bus started");
        Ok(bus)
    }

    pub fn downgrade(&self) -> WeakBus {
        WeakBus { inner: Arc::downgrade(&self.inner) }
    }

    pub fn options(&self) -> &BusOptions {
        &self.inner.options
    }

    pub fn self_device_id(&self) -> DeviceId {
        self.inner.self_id
    }

    /// Milliseconds since the bus was created.
    pub fn timestamp(&self) -> f64 {
        self.inner.scheduler.timestamp()
    }

    /// Tokio instant of bus time `timestamp`.
    pub fn instant_at(&self, timestamp: f64) -> Instant {
        self.inner.scheduler.instant_at(timestamp)
    }

    pub fn scheduler(&self) -> &TokioScheduler {
        &self.inner.scheduler
    }

    pub fn names(&self) -> &dyn DeviceNames {
        self.inner.names.as_ref()
    }

    pub fn read_state<R>(&self, f: impl FnOnce(&BusState) -> R) -> R {
        f(&self.inner.state.lock())
    }

    pub(crate) fn write_state<R>(&self, f: impl FnOnce(&mut BusState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }

    pub fn stats(&self) -> BusStats {
        self.read_state(|s| s.stats())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// Bus events as a stream. Events missed by a lagging consumer are skipped.
    pub fn events(&self) -> impl Stream<Item = BusEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move { event.ok() })
    }

    pub(crate) fn emit(&self, event: BusEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn device(&self, id: DeviceId) -> Option<DeviceHandle> {
        self.read_state(|s| s.devices.contains_key(&id))
            .then(|| DeviceHandle::new(self.clone(), id))
    }

    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.read_state(|s| s.devices.keys().copied().collect::<Vec<_>>())
            .into_iter()
            .map(|id| DeviceHandle::new(self.clone(), id))
            .collect()
    }

    pub fn services(&self, filter: &ServiceFilter) -> Vec<ServiceHandle> {
        self.read_state(|s| s.service_paths(filter))
            .into_iter()
            .map(|path| ServiceHandle::new(self.clone(), path))
            .collect()
    }

    /// Register a transport and start pumping its inbound frames into the bus.
    pub fn add_transport(&self, transport: Transport) -> Arc<Transport> {
        let transport = Arc::new(transport);
        self.inner.transports.write().push(transport.clone());
        self.spawn_pump(transport.clone());
        transport
    }

    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.inner.transports.read().clone()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<Transport>> {
        self.inner.transports.read().get(index).cloned()
    }

    /// Connected if any transport is, else the most active state among them.
    pub fn connection_state(&self) -> ConnectionState {
        let states: Vec<_> = self.inner.transports.read().iter().map(|t| t.state()).collect();
        [
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::Disconnecting,
        ]
        .into_iter()
        .find(|wanted| states.contains(wanted))
        .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Connect every transport. All are attempted; the first failure is returned.
    pub async fn connect(&self) -> Result<()> {
        let mut first_error = None;
        for transport in self.transports() {
            if let Err(e) = transport.connect(false).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut first_error = None;
        for transport in self.transports() {
            if let Err(e) = transport.disconnect().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Decode a received buffer and dispatch every packet in it, in order.
    pub fn process_frame(&self, buffer: &[u8]) {
        let decoded = decode_frames(buffer, self.timestamp());
        self.write_state(|s| {
            s.stats.frames += 1;
            s.stats.malformed_frames += decoded.malformed as u64;
        });
        for pkt in decoded.packets {
            self.process_packet(pkt);
        }
    }

    /// Dispatch one packet. Packets without a timestamp are stamped with bus time.
    pub fn process_packet(&self, pkt: Packet) {
        let now = self.timestamp();
        let pkt = if pkt.timestamp() == 0.0 { pkt.with_timestamp(now) } else { pkt };
        trace!(packet = %pkt, "process");

        let mut out = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.process_packet(&pkt, now, &mut out);
            for event in out {
                self.emit(event);
            }
        }

        if pkt.is_command()
            && !pkt.is_multi_command()
            && pkt.requires_ack()
            && pkt.device_id() == self.inner.self_id
        {
            let ack = Packet::crc_ack(self.inner.self_id, pkt.crc());
            let bus = self.clone();
            tokio::spawn(async move {
                if let Err(e) = bus.send_packet(ack).await {
                    debug!(error = %e, "failed to acknowledge command");
                }
            });
        }
    }

    /// Send a packet on every connected transport.
    ///
    /// Every connected transport receives the frame even if an earlier one fails; the
    /// first error is returned. With no transport connected the packet is still emitted
    /// as [`BusEvent::PacketSend`] for local listeners.
    pub async fn send_packet(&self, pkt: Packet) -> Result<()> {
        let pkt = pkt.with_timestamp(self.timestamp());
        trace!(packet = %pkt, "send");
        self.write_state(|s| s.stats.sent += 1);
        self.emit(BusEvent::PacketSend(pkt.clone()));

        let frame = pkt.to_frame();
        let mut first_error = None;
        for transport in self.transports().iter().filter(|t| t.is_connected()) {
            if let Err(e) = transport.send_frame(&frame).await {
                warn!(kind = %transport.kind(), error = %e, "send failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Send with the ack-requested flag, resending until the destination acknowledges
    /// the frame CRC or the ack policy runs out.
    pub async fn send_packet_with_ack(&self, pkt: Packet) -> Result<()> {
        let pkt = pkt.with_requires_ack(true);
        let device = pkt.device_id();
        let crc = pkt.crc();
        let policy = self.options().ack.clone();
        let interval = Duration::from_millis(policy.interval_ms);
        let mut events = self.subscribe();

        for attempt in 0..policy.attempts {
            trace!(device = %device, crc, attempt, "send with ack");
            self.send_packet(pkt.clone_packet()).await?;
            let deadline = tokio::time::sleep(interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(BusEvent::CrcAck { device: d, crc: c }) if d == device && c == crc => {
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "ack wait lagged behind bus events");
                        }
                        Err(RecvError::Closed) => return Err(BusError::closed("bus")),
                    },
                    _ = &mut deadline => break,
                }
            }
        }
        Err(BusError::timeout(
            format!("ack from {device} for crc {crc:#06x}"),
            interval * policy.attempts,
        ))
    }

    /// Send the host's own announce, then age out silent devices.
    async fn self_announce(&self) {
        let count = self.inner.announces.fetch_add(1, Ordering::Relaxed);
        let mut flags = (count.saturating_add(1)).min(ANNOUNCE_RESTART_COUNTER_MASK)
            | ANNOUNCE_SUPPORTS_ACK
            | ANNOUNCE_SUPPORTS_BROADCAST
            | ANNOUNCE_SUPPORTS_FRAMES;
        if self.options().client {
            flags |= ANNOUNCE_IS_CLIENT;
        }
        match Packet::announce(self.inner.self_id, flags, &[]) {
            Ok(pkt) => {
                if let Err(e) = self.send_packet(pkt).await {
                    debug!(error = %e, "self announce failed");
                }
            }
            Err(e) => warn!(error = %e, "could not build self announce"),
        }
        self.emit(BusEvent::SelfAnnounce);

        let now = self.timestamp();
        let options = self.options();
        let mut out = Vec::new();
        let mut state = self.inner.state.lock();
        state.collect_garbage(
            now,
            options.device_lost_delay_ms as f64,
            options.device_disconnect_delay_ms as f64,
            &mut out,
        );
        for event in out {
            self.emit(event);
        }
    }

    /// Announce now, then once per announce interval until the bus is dropped.
    fn spawn_announcer(&self) {
        let weak = self.downgrade();
        let mut announce = move || {
            if let Some(bus) = weak.upgrade() {
                tokio::spawn(async move { bus.self_announce().await });
            }
        };
        announce();
        let timer =
            self.inner.scheduler.set_interval(self.options().announce_interval(), Box::new(announce));
        *self.inner.announcer.lock() = Some(timer);
    }

    fn spawn_pump(&self, transport: Arc<Transport>) {
        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();
        let mut inbound = transport.take_events();
        if inbound.is_none() {
            warn!(kind = %transport.kind(), "transport events already taken; frames will not reach the bus");
        }
        let mut states = transport.state_changes();
        tokio::spawn(async move {
            loop {
                let next = async {
                    match inbound.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = next => match event {
                        Some(TransportEvent::Frame(buffer)) => {
                            let Some(bus) = weak.upgrade() else { break };
                            bus.process_frame(&buffer);
                        }
                        Some(TransportEvent::Lost { reason }) => transport.handle_lost(&reason).await,
                        None => inbound = None,
                    },
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(bus) = weak.upgrade() else { break };
                        bus.emit(BusEvent::ConnectionChange(bus.connection_state()));
                    }
                }
            }
            trace!(kind = %transport.kind(), "transport pump stopped");
        });
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("self_id", &self.inner.self_id)
            .field("transports", &self.inner.transports.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn options() -> BusOptions {
        BusOptions { self_device_id: Some(DeviceId::new([0xaa; 8])), ..BusOptions::default() }
    }

    fn announce_frame(id: DeviceId) -> Vec<u8> {
        Packet::announce(id, 1, &[SRV_BUTTON]).unwrap().to_frame()
    }

    #[tokio::test(start_paused = true)]
    async fn frames_from_transport_build_the_graph() {
        let bus = Bus::new(options()).unwrap();
        let (io, handle) = LoopbackTransport::new();
        bus.add_transport(Transport::new(io));
        bus.connect().await.unwrap();
        assert_eq!(bus.connection_state(), ConnectionState::Connected);

        let id = DeviceId::new([1; 8]);
        handle.inject(announce_frame(id));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let device = bus.device(id).expect("device announced");
        assert_eq!(device.service_classes(), vec![SRV_BUTTON]);
        assert_eq!(bus.services(&ServiceFilter::class(SRV_BUTTON)).len(), 1);
        assert_eq!(bus.stats().frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn self_announce_is_sent_periodically() {
        let bus = Bus::new(options()).unwrap();
        let (io, handle) = LoopbackTransport::new();
        bus.add_transport(Transport::new(io));
        bus.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let announces: Vec<_> = handle
            .sent_packets()
            .into_iter()
            .filter(|p| p.is_announce() && p.device_id() == bus.self_device_id())
            .collect();
        assert!(announces.len() >= 2);
        assert!(announces[0].data()[1] & (ANNOUNCE_IS_CLIENT >> 8) as u8 != 0);
    }

    #[tokio::test(start_paused = true)]
    async fn announcer_stops_when_the_bus_is_dropped() {
        let bus = Bus::new(options()).unwrap();
        let mut events = bus.subscribe();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let mut announces = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BusEvent::SelfAnnounce) {
                announces += 1;
            }
        }
        // at 0, 499 and 998 ms
        assert_eq!(announces, 3);

        let weak = bus.downgrade();
        drop(bus);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(weak.upgrade().is_none());
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_devices_are_lost_then_disconnected() {
        let bus = Bus::new(options()).unwrap();
        let mut events = bus.subscribe();
        let id = DeviceId::new([1; 8]);
        bus.process_packet(Packet::announce(id, 1, &[]).unwrap());

        tokio::time::sleep(Duration::from_millis(3600)).await;
        assert!(bus.device(id).is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                BusEvent::DeviceLost(d) | BusEvent::DeviceDisconnect(d) if d == id => seen.push(event),
                _ => {}
            }
        }
        assert!(matches!(seen[..], [BusEvent::DeviceLost(_), BusEvent::DeviceDisconnect(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn send_reaches_all_connected_transports_and_reports_first_error() {
        let bus = Bus::new(options()).unwrap();
        let (a, handle_a) = LoopbackTransport::new();
        let (b, handle_b) = LoopbackTransport::new();
        bus.add_transport(Transport::new(a));
        bus.add_transport(Transport::new(b));
        bus.connect().await.unwrap();
        handle_a.fail_send(true);

        let target = DeviceId::new([1; 8]);
        let pkt = Packet::only_header(0x80).into_command(target, 1);
        assert!(bus.send_packet(pkt).await.is_err());
        let delivered = handle_b.sent_packets().into_iter().filter(|p| p.device_id() == target).count();
        assert_eq!(delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_wait_times_out_after_policy_attempts() {
        let bus = Bus::new(options()).unwrap();
        let (io, handle) = LoopbackTransport::new();
        bus.add_transport(Transport::new(io));
        bus.connect().await.unwrap();
        handle.clear_sent();

        let target = DeviceId::new([1; 8]);
        let pkt = Packet::only_header(0x80).into_command(target, 1);
        let err = bus.send_packet_with_ack(pkt).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
        let resent = handle.sent_packets().into_iter().filter(|p| p.device_id() == target).count();
        assert_eq!(resent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_resolves_on_matching_crc() {
        let bus = Bus::new(options()).unwrap();
        let target = DeviceId::new([1; 8]);
        let pkt = Packet::only_header(0x80).into_command(target, 1);
        let crc = pkt.clone().with_requires_ack(true).crc();

        let responder = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            responder.process_packet(Packet::crc_ack(target, crc));
        });
        bus.send_packet_with_ack(pkt).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn self_commands_requesting_ack_are_acknowledged() {
        let bus = Bus::new(options()).unwrap();
        let mut events = bus.subscribe();
        let cmd = Packet::only_header(0x80)
            .into_command(bus.self_device_id(), SERVICE_INDEX_PIPE)
            .with_requires_ack(true);
        let crc = cmd.crc();
        bus.process_packet(cmd);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut acked = false;
        while let Ok(event) = events.try_recv() {
            if let BusEvent::PacketSend(p) = event {
                acked |= p.is_crc_ack() && p.service_command() == crc;
            }
        }
        assert!(acked);
    }
}

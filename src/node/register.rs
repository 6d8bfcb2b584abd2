//! Registers: last reported value plus the get/set/refresh protocol.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use super::{RefreshAction, RefreshOp, RegisterPath, ServiceHandle};
use crate::bus::{Bus, BusEvent};
use crate::catalog::RegisterKind;
use crate::constants::{CMD_GET_REG, CMD_REG_MASK, CMD_SET_REG};
use crate::packet::Packet;
use crate::stream::{ThrottleExt, UpdateRate};
use crate::{BusError, Result};

/// Register state held in the arena.
#[derive(Debug, Clone)]
pub struct RegisterNode {
    code: u16,
    kind: RegisterKind,
    reading: bool,
    last_report: Option<Packet>,
}

impl RegisterNode {
    pub(crate) fn new(code: u16, kind: RegisterKind, reading: bool) -> Self {
        Self { code, kind, reading, last_report: None }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn data(&self) -> Option<&Arc<[u8]>> {
        self.last_report.as_ref().map(|p| p.data())
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_report.as_ref().map(|p| p.timestamp())
    }

    /// Store a report. Always emits `ReportReceive`; emits `ReportUpdate` only when the
    /// payload bytes differ from the stored value.
    pub(crate) fn process_report(
        &mut self,
        path: RegisterPath,
        pkt: &Packet,
        out: &mut Vec<BusEvent>,
    ) {
        let updated = self.data().map(|d| &d[..]) != Some(&pkt.data()[..]);
        self.last_report = Some(pkt.clone());
        out.push(BusEvent::ReportReceive { path, packet: pkt.clone() });
        if updated {
            trace!(%path, "register updated");
            out.push(BusEvent::ReportUpdate { path, data: pkt.data().clone() });
        }
    }
}

/// Little-endian unsigned value of a 1, 2 or 4 byte register payload.
pub(crate) fn int_of_buffer(data: &[u8]) -> Option<u32> {
    match data.len() {
        0 => None,
        1 => Some(data[0] as u32),
        2 | 3 => Some(u16::from_le_bytes([data[0], data[1]]) as u32),
        _ => Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
    }
}

/// Handle to one register of a service.
#[derive(Debug, Clone)]
pub struct RegisterHandle {
    bus: Bus,
    path: RegisterPath,
}

impl RegisterHandle {
    pub(crate) fn new(bus: Bus, path: RegisterPath) -> Self {
        Self { bus, path }
    }

    pub fn path(&self) -> RegisterPath {
        self.path
    }

    pub fn code(&self) -> u16 {
        self.path.code
    }

    pub fn service(&self) -> ServiceHandle {
        ServiceHandle::new(self.bus.clone(), self.path.service())
    }

    fn read<R>(&self, f: impl FnOnce(&RegisterNode) -> R) -> Option<R> {
        self.bus.read_state(|state| state.register(self.path).map(f))
    }

    /// Whether the register still resolves in the graph.
    pub fn exists(&self) -> bool {
        self.read(|_| ()).is_some()
    }

    pub fn kind(&self) -> Option<RegisterKind> {
        self.read(|r| r.kind())
    }

    pub fn is_reading(&self) -> bool {
        self.read(|r| r.is_reading()).unwrap_or(false)
    }

    /// Payload of the last report.
    pub fn data(&self) -> Option<Arc<[u8]>> {
        self.read(|r| r.data().cloned()).flatten()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.read(|r| r.last_timestamp()).flatten()
    }

    pub fn int_value(&self) -> Option<u32> {
        self.data().and_then(|d| int_of_buffer(&d))
    }

    pub fn i32_value(&self) -> Option<i32> {
        let data = self.data()?;
        let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(i32::from_le_bytes(bytes))
    }

    pub fn bool_value(&self) -> Option<bool> {
        self.data().map(|d| int_of_buffer(&d).unwrap_or(0) != 0)
    }

    /// UTF-8 value; invalid sequences are replaced.
    pub fn string_value(&self) -> Option<String> {
        self.data().map(|d| String::from_utf8_lossy(&d).into_owned())
    }

    /// Send a set-register command. With `auto_refresh`, a get follows after the
    /// configured delay to read back the value the device actually applied.
    pub async fn send_set(&self, data: &[u8], auto_refresh: bool) -> Result<()> {
        let pkt = Packet::from_command(CMD_SET_REG | (self.path.code & CMD_REG_MASK), data)?;
        self.service().send_packet(pkt, self.uses_acks()).await?;
        if auto_refresh {
            tokio::time::sleep(Duration::from_millis(self.bus.options().auto_refresh_delay_ms))
                .await;
            self.send_get().await?;
        }
        Ok(())
    }

    pub async fn send_set_int(&self, value: u32, auto_refresh: bool) -> Result<()> {
        self.send_set(&value.to_le_bytes(), auto_refresh).await
    }

    pub async fn send_set_bool(&self, value: bool, auto_refresh: bool) -> Result<()> {
        self.send_set(&[value as u8], auto_refresh).await
    }

    pub async fn send_set_string(&self, value: &str, auto_refresh: bool) -> Result<()> {
        self.send_set(value.as_bytes(), auto_refresh).await
    }

    /// Send a get-register command. Const registers with a known value skip the round trip.
    pub async fn send_get(&self) -> Result<()> {
        let (kind, has_value) = self
            .read(|r| (r.kind(), r.data().is_some()))
            .ok_or(BusError::DeviceLost { device: self.path.device })?;
        if kind == RegisterKind::Const && has_value {
            return Ok(());
        }
        self.send_get_unchecked().await
    }

    async fn send_get_unchecked(&self) -> Result<()> {
        let pkt = Packet::only_header(CMD_GET_REG | (self.path.code & CMD_REG_MASK));
        self.service().send_packet(pkt, false).await
    }

    fn uses_acks(&self) -> bool {
        self.service().device().supports_ack()
    }

    /// Read the register until a report arrives or the refresh policy times out.
    ///
    /// Returns immediately when a value is known and either `skip_if_value` is set or
    /// the register is const. Fails with [`BusError::DeviceLost`] as soon as the device
    /// leaves the bus.
    pub async fn refresh(&self, skip_if_value: bool) -> Result<()> {
        let (kind, has_value) = self
            .read(|r| (r.kind(), r.data().is_some()))
            .ok_or(BusError::DeviceLost { device: self.path.device })?;
        if has_value && (skip_if_value || kind == RegisterKind::Const) {
            return Ok(());
        }

        let policy = self.bus.options().refresh.clone();
        let mut events = self.bus.subscribe();
        let mut op = RefreshOp::new(&policy);
        let mut action = op.start(self.bus.timestamp());

        loop {
            match action {
                RefreshAction::SendGet { attempt } => {
                    trace!(path = %self.path, attempt, "refresh get");
                    self.send_get_unchecked().await?;
                    action = op.poll(self.bus.timestamp());
                }
                RefreshAction::WaitUntil(deadline) => {
                    let wake = self.bus.instant_at(deadline);
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(BusEvent::ReportReceive { path, .. }) if path == self.path => {
                                op.report_received();
                                action = op.poll(self.bus.timestamp());
                            }
                            Ok(BusEvent::DeviceDisconnect(device)) if device == self.path.device => {
                                return Err(BusError::DeviceLost { device });
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(path = %self.path, skipped, "refresh lagged behind bus events");
                                if self.last_timestamp().is_some_and(|t| t >= op.started()) {
                                    op.report_received();
                                    action = op.poll(self.bus.timestamp());
                                }
                            }
                            Err(RecvError::Closed) => return Err(BusError::closed("bus")),
                        },
                        _ = tokio::time::sleep_until(wake) => {
                            action = op.poll(self.bus.timestamp());
                        }
                    }
                }
                RefreshAction::Done => return Ok(()),
                RefreshAction::TimedOut => {
                    debug!(path = %self.path, gets = op.gets_sent(), "refresh timed out");
                    return Err(BusError::timeout(
                        format!("refresh of {}", self.path),
                        Duration::from_millis(policy.timeout_ms),
                    ));
                }
            }
        }
    }

    /// Stream of payloads, one per value change, optionally rate limited.
    pub fn updates(&self, rate: UpdateRate) -> impl Stream<Item = Arc<[u8]>> + Send + 'static {
        let path = self.path;
        let values = BroadcastStream::new(self.bus.subscribe()).filter_map(move |event| async move {
            match event {
                Ok(BusEvent::ReportUpdate { path: p, data }) if p == path => Some(data),
                _ => None,
            }
        });
        match rate.interval() {
            None => values.boxed(),
            Some(interval) => values.throttle(interval).boxed(),
        }
    }
}

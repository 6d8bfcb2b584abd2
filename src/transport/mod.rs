//! Transports: byte-level frame sources and sinks with a uniform lifecycle.
//!
//! A [`Transport`] wraps one [`TransportIo`] implementation with the connection state
//! machine. The I/O side only knows how to open, close and write frames; received
//! buffers and unsolicited disconnects flow back through a [`TransportSink`].
//!
//! ```text
//!            connect()                 open ok
//! Disconnected ───────► Connecting ───────────► Connected
//!      ▲                    │ open err              │ disconnect() / lost
//!      └────────────────────┴───── Disconnecting ◄──┘
//! ```

mod framing;
mod loopback;
#[cfg(feature = "serial")]
mod serial;
mod socket;
mod worker;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::packet::Packet;
use crate::{BusError, Result};

pub use framing::{CobsFramer, LengthPrefixFramer};
pub use loopback::{LoopbackHandle, LoopbackTransport};
#[cfg(feature = "serial")]
pub use serial::{SerialConfig, SerialTransport};
pub use socket::SocketTransport;
pub use worker::{WorkerEndpoint, WorkerMessage, WorkerTransport, worker_channel};

/// Physical or logical link a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Usb,
    Serial,
    Bluetooth,
    Worker,
    Socket,
    Loopback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Usb => "usb",
            TransportKind::Serial => "serial",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Worker => "worker",
            TransportKind::Socket => "socket",
            TransportKind::Loopback => "loopback",
        };
        f.write_str(name)
    }
}

/// Connection lifecycle state, shared by transports and the bus aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What an I/O implementation reports back to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One received buffer, possibly holding several frames.
    Frame(Vec<u8>),
    /// The link went away without a `close()` request.
    Lost { reason: String },
}

/// Host environment notification that the underlying device came or went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotPlug {
    Arrived,
    Removed,
}

/// Channel through which I/O implementations deliver received data.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    /// Deliver a received buffer. Returns `false` once nobody listens anymore.
    pub fn frame(&self, data: Vec<u8>) -> bool {
        self.tx.send(TransportEvent::Frame(data)).is_ok()
    }

    /// Report that the link dropped.
    pub fn lost(&self, reason: impl Into<String>) -> bool {
        self.tx.send(TransportEvent::Lost { reason: reason.into() }).is_ok()
    }
}

/// Raw link operations a transport variant implements.
///
/// `open` must spawn whatever reader is needed and feed the sink; `close` must stop it.
/// Neither is called concurrently with the other.
#[async_trait]
pub trait TransportIo: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Open the link. `background` is set for automatic reconnects that should not prompt
    /// the user, such as hot-plug arrivals.
    async fn open(&mut self, background: bool, sink: TransportSink) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// A transport with its connection state machine.
pub struct Transport {
    kind: TransportKind,
    io: tokio::sync::Mutex<Box<dyn TransportIo>>,
    lifecycle: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(io: impl TransportIo) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            kind: io.kind(),
            io: tokio::sync::Mutex::new(Box::new(io)),
            lifecycle: tokio::sync::Mutex::new(()),
            state,
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver of state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect the link.
    ///
    /// Connecting an already connected transport succeeds immediately. Concurrent calls
    /// wait for the one in flight and then observe its outcome. On failure the state
    /// returns to `Disconnected` and the error is returned.
    pub async fn connect(&self, background: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let sink = TransportSink::new(self.events_tx.clone());
        let result = self.io.lock().await.open(background, sink).await;
        match result {
            Ok(()) => {
                info!(kind = %self.kind, background, "transport connected");
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "transport connect failed");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Disconnect the link. Disconnecting a disconnected transport is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);
        let result = self.io.lock().await.close().await;
        self.set_state(ConnectionState::Disconnected);
        match &result {
            Ok(()) => info!(kind = %self.kind, "transport disconnected"),
            Err(e) => warn!(kind = %self.kind, error = %e, "transport close failed"),
        }
        result
    }

    /// Encode and write one packet.
    pub async fn send_packet(&self, pkt: &Packet) -> Result<()> {
        self.send_frame(&pkt.to_frame()).await
    }

    /// Write one encoded frame. Fails when the transport is not connected.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::transport(self.kind, "not connected"));
        }
        self.io.lock().await.send_frame(frame).await
    }

    /// Handle an unsolicited loss reported by the I/O side.
    pub async fn handle_lost(&self, reason: &str) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        warn!(kind = %self.kind, reason, "transport lost");
        self.set_state(ConnectionState::Disconnecting);
        if let Err(e) = self.io.lock().await.close().await {
            debug!(kind = %self.kind, error = %e, "close after loss failed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Take the receiver of inbound events. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    /// Follow hot-plug notifications: connect in the background on arrival, disconnect
    /// on removal. Stops when the transport is dropped or the sender goes away.
    pub fn watch_hotplug(self: &Arc<Self>, mut notifications: broadcast::Receiver<HotPlug>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let note = tokio::select! {
                    _ = cancel.cancelled() => break,
                    note = notifications.recv() => note,
                };
                let Some(transport) = weak.upgrade() else { break };
                let result = match note {
                    Ok(HotPlug::Arrived) => transport.connect(true).await,
                    Ok(HotPlug::Removed) => transport.disconnect().await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "hot-plug notifications lagged");
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = result {
                    warn!(kind = %transport.kind, error = %e, "hot-plug transition failed");
                }
            }
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(kind = %self.kind, from = %current, to = %state, "transport state");
                *current = state;
                true
            }
        });
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("kind", &self.kind).field("state", &self.state()).finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

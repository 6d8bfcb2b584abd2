//! Transport proxied through a background worker over message passing.
//!
//! The worker owns the physical device (USB, Bluetooth) and exchanges
//! [`WorkerMessage`] values with the host. Connect and disconnect requests carry a
//! random correlation id; the worker answers with a message of the same type and id,
//! optionally carrying an error. Outbound packets are posted without waiting.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::{TransportIo, TransportKind, TransportSink};
use crate::{BusError, Result};

/// Message exchanged with the worker, JSON shaped as `{type, id?, payload?, error?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// One encoded packet.
    Packet { payload: Vec<u8> },
    /// One received buffer of frames.
    Frame { payload: Vec<u8> },
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        background: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Disconnect request or reply. Without an id it announces that the worker lost the
    /// device on its own.
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkerMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| BusError::parse("worker message", e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BusError::parse("worker message", e.to_string()))
    }

    /// Reply to a connect or disconnect request.
    pub fn reply(&self, error: Option<String>) -> Option<WorkerMessage> {
        match self {
            WorkerMessage::Connect { id, .. } => {
                Some(WorkerMessage::Connect { id: id.clone(), background: None, error })
            }
            WorkerMessage::Disconnect { id, .. } => {
                Some(WorkerMessage::Disconnect { id: id.clone(), error })
            }
            _ => None,
        }
    }
}

/// Worker side of the message channel.
#[derive(Debug)]
pub struct WorkerEndpoint {
    incoming: mpsc::UnboundedReceiver<WorkerMessage>,
    outgoing: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerEndpoint {
    /// Next message from the host; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.incoming.recv().await
    }

    pub fn send(&self, msg: WorkerMessage) -> bool {
        self.outgoing.send(msg).is_ok()
    }
}

/// Host side of the message channel, consumed by [`WorkerTransport::new`].
#[derive(Debug)]
pub struct WorkerPort {
    to_worker: mpsc::UnboundedSender<WorkerMessage>,
    from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// Create a connected host/worker channel pair.
pub fn worker_channel() -> (WorkerPort, WorkerEndpoint) {
    let (to_worker, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_worker) = mpsc::unbounded_channel();
    (WorkerPort { to_worker, from_worker }, WorkerEndpoint { incoming, outgoing })
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Option<String>>>>>;
type DeviceRequest =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

pub struct WorkerTransport {
    kind: TransportKind,
    to_worker: mpsc::UnboundedSender<WorkerMessage>,
    from_worker: Option<mpsc::UnboundedReceiver<WorkerMessage>>,
    pending: Pending,
    sink: Arc<Mutex<Option<TransportSink>>>,
    reply_timeout: Duration,
    request_device: Option<DeviceRequest>,
}

impl WorkerTransport {
    pub fn new(kind: TransportKind, port: WorkerPort) -> Self {
        Self {
            kind,
            to_worker: port.to_worker,
            from_worker: Some(port.from_worker),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink: Arc::new(Mutex::new(None)),
            reply_timeout: Duration::from_secs(5),
            request_device: None,
        }
    }

    /// USB device bound inside the worker.
    pub fn usb(port: WorkerPort) -> Self {
        Self::new(TransportKind::Usb, port)
    }

    /// Bluetooth device bound inside the worker.
    pub fn bluetooth(port: WorkerPort) -> Self {
        Self::new(TransportKind::Bluetooth, port)
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Hook run before a foreground connect, typically to ask the user for device access.
    pub fn with_device_request<F, Fut>(mut self, request: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.request_device = Some(Box::new(move || Box::pin(request())));
        self
    }

    fn ensure_pump(&mut self) {
        let Some(mut from_worker) = self.from_worker.take() else { return };
        let pending = self.pending.clone();
        let sink = self.sink.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            while let Some(msg) = from_worker.recv().await {
                trace!(%kind, ?msg, "worker message");
                match msg {
                    WorkerMessage::Packet { payload } | WorkerMessage::Frame { payload } => {
                        if let Some(sink) = sink.lock().as_ref() {
                            sink.frame(payload);
                        }
                    }
                    WorkerMessage::Connect { id: Some(id), error, .. }
                    | WorkerMessage::Disconnect { id: Some(id), error } => {
                        match pending.lock().remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(error);
                            }
                            None => debug!(%kind, %id, "reply without pending request"),
                        }
                    }
                    WorkerMessage::Disconnect { id: None, error } => {
                        if let Some(sink) = sink.lock().take() {
                            sink.lost(error.unwrap_or_else(|| "worker lost the device".into()));
                        }
                    }
                    WorkerMessage::Connect { id: None, .. } => {
                        warn!(%kind, "connect message without correlation id");
                    }
                }
            }
            debug!(%kind, "worker channel closed");
            if let Some(sink) = sink.lock().take() {
                sink.lost("worker terminated");
            }
        });
    }

    async fn request(&mut self, make: impl FnOnce(String) -> WorkerMessage) -> Result<()> {
        self.ensure_pump();
        let id = format!("{:016x}", rand::random::<u64>());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let msg = make(id.clone());
        let what = match msg {
            WorkerMessage::Connect { .. } => "worker connect",
            _ => "worker disconnect",
        };
        if self.to_worker.send(msg).is_err() {
            self.pending.lock().remove(&id);
            return Err(BusError::transport(self.kind, "worker is gone"));
        }

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(error))) => Err(BusError::transport(self.kind, error)),
            Ok(Err(_)) => Err(BusError::transport(self.kind, "worker dropped the request")),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(BusError::timeout(what, self.reply_timeout))
            }
        }
    }
}

impl std::fmt::Debug for WorkerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTransport")
            .field("kind", &self.kind)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

#[async_trait]
impl TransportIo for WorkerTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&mut self, background: bool, sink: TransportSink) -> Result<()> {
        if !background {
            if let Some(request) = &self.request_device {
                request().await?;
            }
        }
        *self.sink.lock() = Some(sink);
        let result = self
            .request(|id| WorkerMessage::Connect {
                id: Some(id),
                background: Some(background),
                error: None,
            })
            .await;
        if result.is_err() {
            *self.sink.lock() = None;
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        let result =
            self.request(|id| WorkerMessage::Disconnect { id: Some(id), error: None }).await;
        *self.sink.lock() = None;
        result
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.to_worker
            .send(WorkerMessage::Packet { payload: frame.to_vec() })
            .map_err(|_| BusError::transport(self.kind, "worker is gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionState, Transport, TransportEvent};

    fn spawn_echo_worker(mut endpoint: WorkerEndpoint, refuse_connect: bool) {
        tokio::spawn(async move {
            while let Some(msg) = endpoint.recv().await {
                match &msg {
                    WorkerMessage::Connect { .. } => {
                        let error = refuse_connect.then(|| "no device selected".to_string());
                        endpoint.send(msg.reply(error).unwrap());
                    }
                    WorkerMessage::Disconnect { .. } => {
                        endpoint.send(msg.reply(None).unwrap());
                    }
                    WorkerMessage::Packet { payload } => {
                        endpoint.send(WorkerMessage::Frame { payload: payload.clone() });
                    }
                    WorkerMessage::Frame { .. } => {}
                }
            }
        });
    }

    #[test]
    fn message_json_shape() {
        let msg = WorkerMessage::Connect { id: Some("42".into()), background: Some(true), error: None };
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"connect","id":"42","background":true}"#);
        assert_eq!(WorkerMessage::from_json(&json).unwrap(), msg);

        let frame = WorkerMessage::from_json(r#"{"type":"frame","payload":[1,2]}"#).unwrap();
        assert_eq!(frame, WorkerMessage::Frame { payload: vec![1, 2] });

        let lost = WorkerMessage::from_json(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(lost, WorkerMessage::Disconnect { id: None, error: None });
    }

    #[tokio::test]
    async fn requests_resolve_by_correlation_id() {
        let (port, endpoint) = worker_channel();
        spawn_echo_worker(endpoint, false);
        let transport = Transport::new(WorkerTransport::usb(port));
        let mut events = transport.take_events().unwrap();

        transport.connect(false).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::Usb);

        transport.send_frame(&[5, 6, 7]).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Frame(vec![5, 6, 7])));

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn worker_error_rejects_connect() {
        let (port, endpoint) = worker_channel();
        spawn_echo_worker(endpoint, true);
        let transport = Transport::new(WorkerTransport::bluetooth(port));

        let err = transport.connect(true).await.unwrap_err();
        assert!(err.to_string().contains("no device selected"));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_times_out() {
        let (port, _endpoint) = worker_channel();
        let transport = Transport::new(
            WorkerTransport::usb(port).with_reply_timeout(Duration::from_millis(100)),
        );
        let err = transport.connect(true).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unsolicited_disconnect_surfaces_loss() {
        let (port, mut endpoint) = worker_channel();
        let transport = Transport::new(WorkerTransport::usb(port));
        let mut events = transport.take_events().unwrap();

        let worker = tokio::spawn(async move {
            let msg = endpoint.recv().await.unwrap();
            endpoint.send(msg.reply(None).unwrap());
            endpoint.send(WorkerMessage::Disconnect { id: None, error: Some("unplugged".into()) });
            endpoint
        });
        transport.connect(true).await.unwrap();
        let _endpoint = worker.await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Lost { reason: "unplugged".into() })
        );
    }
}

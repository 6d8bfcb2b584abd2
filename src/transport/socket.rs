//! TCP transport used for trace servers and simulators.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{LengthPrefixFramer, TransportIo, TransportKind, TransportSink};
use crate::{BusError, Result};

/// Frames over a TCP stream, each prefixed by its one-byte length.
#[derive(Debug)]
pub struct SocketTransport {
    addr: String,
    writer: Option<OwnedWriteHalf>,
    reader: Option<CancellationToken>,
}

impl SocketTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), writer: None, reader: None }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl TransportIo for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&mut self, _background: bool, sink: TransportSink) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            BusError::transport_with_source(
                TransportKind::Socket,
                format!("connect to {}", self.addr),
                e,
            )
        })?;
        let _ = stream.set_nodelay(true);
        let (mut read, write) = stream.into_split();
        info!(addr = %self.addr, "socket open");

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut framer = LengthPrefixFramer::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => return,
                    n = read.read(&mut buf) => n,
                };
                match n {
                    Ok(0) => {
                        sink.lost("connection closed by peer");
                        return;
                    }
                    Ok(n) => {
                        for frame in framer.push(&buf[..n]) {
                            if !sink.frame(frame) {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        sink.lost(e.to_string());
                        return;
                    }
                }
            }
        });

        self.writer = Some(write);
        self.reader = Some(token);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(token) = self.reader.take() {
            token.cancel();
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "socket shutdown failed");
            }
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BusError::transport(TransportKind::Socket, "socket not open"))?;
        writer
            .write_all(&LengthPrefixFramer::encode(frame)?)
            .await
            .map_err(|e| BusError::transport_with_source(TransportKind::Socket, "write", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportEvent};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchanges_frames_with_a_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let transport = Transport::new(SocketTransport::new(addr));
        let mut events = transport.take_events().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), transport.connect(false));
        connected.unwrap();
        let (mut peer, _) = accepted.unwrap();

        transport.send_frame(&[1, 2, 3]).await.unwrap();
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [3, 1, 2, 3]);

        peer.write_all(&[2, 9, 8]).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Frame(vec![9, 8])));

        drop(peer);
        assert!(matches!(events.recv().await, Some(TransportEvent::Lost { .. })));
    }

    #[tokio::test]
    async fn connect_failure_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = Transport::new(SocketTransport::new(addr));
        let err = transport.connect(false).await.unwrap_err();
        assert!(matches!(err, BusError::Transport { kind: TransportKind::Socket, .. }));
    }
}

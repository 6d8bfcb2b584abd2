//! Serial port transport, COBS framed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{CobsFramer, TransportIo, TransportKind, TransportSink};
use crate::{BusError, Result};

/// Port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
}

fn default_baud() -> u32 {
    1_000_000
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), baud_rate: default_baud() }
    }
}

pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<CancellationToken>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self { config, writer: None, reader: None }
    }
}

#[async_trait]
impl TransportIo for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn open(&mut self, _background: bool, sink: TransportSink) -> Result<()> {
        let port = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| {
                BusError::transport_with_source(
                    TransportKind::Serial,
                    format!("open {}", self.config.path),
                    e,
                )
            })?;
        info!(path = %self.config.path, baud = self.config.baud_rate, "serial port open");
        let (mut read, write) = tokio::io::split(port);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut framer = CobsFramer::new();
            let mut buf = [0u8; 512];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => return,
                    n = read.read(&mut buf) => n,
                };
                match n {
                    Ok(0) => {
                        sink.lost("serial port closed");
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
        self.writer = None;
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BusError::transport(TransportKind::Serial, "port not open"))?;
        writer
            .write_all(&CobsFramer::encode(frame))
            .await
            .map_err(|e| BusError::transport_with_source(TransportKind::Serial, "write", e))
    }
}

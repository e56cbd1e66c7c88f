//! TCP transport speaking the V2 framing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommandSink, Inbound, Link, Transport};
use crate::address::Address;
use crate::error::{ReaderError, Result};
use crate::protocol::{read_frame, Command, MAGIC_V2};

/// Default timeout for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens TCP links to broker nodes.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &Address) -> Result<Link> {
        let connect = TcpStream::connect((address.host.as_str(), address.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ReaderError::Connect {
                address: address.clone(),
                message: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| ReaderError::Connect {
                address: address.clone(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(MAGIC_V2).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, tx, address.clone()));

        info!(address = %address, "TCP link established");

        Ok(Link {
            sink: Arc::new(TcpSink {
                address: address.clone(),
                writer: Mutex::new(Some(write_half)),
                reader: Mutex::new(Some(reader)),
            }),
            inbound: rx,
        })
    }
}

/// Pump frames from the socket into the connection's mailbox.
async fn read_loop(
    read_half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Inbound>,
    address: Address,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if tx.send(Inbound::Frame(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(address = %address, "Broker closed the connection");
                let _ = tx.send(Inbound::Closed(None));
                break;
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Frame read failed");
                let _ = tx.send(Inbound::Closed(Some(e.to_string())));
                break;
            }
        }
    }
}

struct TcpSink {
    address: Address,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl CommandSink for TcpSink {
    async fn send(&self, command: Command) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| ReaderError::Closed(self.address.clone()))?;
        stream.write_all(&command.encode()).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(address = %self.address, error = %e, "Socket shutdown failed");
            }
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
            let _ = reader.await;
        }
    }
}

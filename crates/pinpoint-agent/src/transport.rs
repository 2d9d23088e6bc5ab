// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of encoded transport frames to the collector.
//!
//! Frames are handed over one at a time, in harvest order. A transport may
//! lose frames when the connection drops; the harvester logs the failure
//! and moves on.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::TransportError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one complete transport frame.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// Forwards frames into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// A transport together with the receiving end of its channel.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

/// Writes frames over one TCP connection to the collector.
///
/// Connects on first use. Any failure drops the connection, so the next
/// frame starts a fresh one; the failed frame itself is not retried.
#[derive(Debug)]
pub struct TcpTransport {
    addr: SocketAddr,
    connect_timeout: Duration,
    write_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            stream: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        debug!("Connecting to collector at {}", self.addr);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };

        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        };
        if result.is_err() {
            debug!("Dropping collector connection to {}", self.addr);
            *guard = None;
        }
        result
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock collector that accepts TCP connections and splits the byte stream
//! into transport frames.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pinpoint_agent::wire::frame::{TransportHeader, TRANSPORT_HEADER_LEN};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Debug)]
pub struct ReceivedFrame {
    pub header: TransportHeader,
    /// Payload frame: signature, version, message type, body.
    pub payload: Vec<u8>,
}

impl ReceivedFrame {
    pub fn message_type(&self) -> u16 {
        u16::from_be_bytes([self.payload[2], self.payload[3]])
    }
}

#[derive(Clone)]
pub struct MockCollector {
    pub addr: SocketAddr,
    pub received_frames: Arc<Mutex<Vec<ReceivedFrame>>>,
}

impl MockCollector {
    /// Start a mock collector on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock collector");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let received_frames = Arc::new(Mutex::new(Vec::new()));
        let frames_clone = received_frames.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(read_frames(stream, frames_clone.clone()));
            }
        });

        Self {
            addr,
            received_frames,
        }
    }

    pub fn frames(&self) -> Vec<ReceivedFrame> {
        self.received_frames.lock().unwrap().clone()
    }

    /// Polls until at least `count` frames arrived or `timeout` elapses.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<ReceivedFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frames = self.frames();
            if frames.len() >= count || tokio::time::Instant::now() >= deadline {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn read_frames(mut stream: TcpStream, frames: Arc<Mutex<Vec<ReceivedFrame>>>) {
    loop {
        let mut header = [0u8; TRANSPORT_HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let header = TransportHeader::parse(&header).expect("complete header");
        let mut payload = vec![0u8; header.data_len as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        frames
            .lock()
            .unwrap()
            .push(ReceivedFrame { header, payload });
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload and transport envelopes around an encoded record.
//!
//! ```text
//! payload:   | 0xEF | 0x10 | messageType u16 | compact struct ... |
//! transport: | requestType u16 | messageID u32 | dataLength u32 | payload ... |
//! ```
//!
//! All header integers are big-endian.

use bytes::{BufMut, Bytes, BytesMut};

use super::compact::{CompactStruct, CompactWriter};
use crate::error::EncodeError;

pub const SIGNATURE: i8 = -17;
pub const VERSION: u8 = 16;
pub const PAYLOAD_HEADER_LEN: usize = 4;

/// Request type of a one-way application message.
pub const APPLICATION_REQUEST: u16 = 5;
pub const TRANSPORT_HEADER_LEN: usize = 10;

/// Message type codes for the records this agent emits.
pub mod message_type {
    pub const SPAN: u16 = 40;
    pub const CUSTOM_METRIC: u16 = 920;
}

/// Encodes `body` behind the four byte payload header.
///
/// Only a body that cannot be serialized fails; there is no size limit.
pub fn encode_frame<S: CompactStruct + ?Sized>(
    message_type: u16,
    body: &S,
) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(64);
    put_payload(&mut buf, message_type, body)?;
    Ok(buf.freeze())
}

/// Encodes `body` as a payload frame wrapped in the transport header.
pub fn encode_transport_frame<S: CompactStruct + ?Sized>(
    message_id: u32,
    message_type: u16,
    body: &S,
) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u16(APPLICATION_REQUEST);
    buf.put_u32(message_id);
    // Length is backfilled once the payload is written.
    buf.put_u32(0);
    put_payload(&mut buf, message_type, body)?;

    let data_len = buf.len() - TRANSPORT_HEADER_LEN;
    let data_len = u32::try_from(data_len).map_err(|_| EncodeError::LengthOverflow {
        what: "payload",
        len: data_len,
    })?;
    buf[6..TRANSPORT_HEADER_LEN].copy_from_slice(&data_len.to_be_bytes());
    Ok(buf.freeze())
}

fn put_payload<S: CompactStruct + ?Sized>(
    buf: &mut BytesMut,
    message_type: u16,
    body: &S,
) -> Result<(), EncodeError> {
    buf.put_i8(SIGNATURE);
    buf.put_u8(VERSION);
    buf.put_u16(message_type);

    let mut writer = CompactWriter::with_buffer(std::mem::take(buf));
    writer.write_struct(body)?;
    *buf = writer.into_inner();
    Ok(())
}

/// Header fields of a transport frame, as read back by a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub request_type: u16,
    pub message_id: u32,
    pub data_len: u32,
}

impl TransportHeader {
    /// Parses the first [`TRANSPORT_HEADER_LEN`] bytes, if present.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let header = buf.get(..TRANSPORT_HEADER_LEN)?;
        Some(Self {
            request_type: u16::from_be_bytes([header[0], header[1]]),
            message_id: u32::from_be_bytes([header[2], header[3], header[4], header[5]]),
            data_len: u32::from_be_bytes([header[6], header[7], header[8], header[9]]),
        })
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tag-length-value struct encoding understood by the collector
//! (Thrift compact protocol, write side only).

use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;

/// Element and field type codes of the compact protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompactType {
    BoolTrue = 1,
    BoolFalse = 2,
    Byte = 3,
    I16 = 4,
    I32 = 5,
    I64 = 6,
    Double = 7,
    Binary = 8,
    List = 9,
    Set = 10,
    Map = 11,
    Struct = 12,
}

const STOP: u8 = 0x00;
const MAX_SHORT_FIELD_DELTA: i32 = 15;
const MAX_SHORT_LIST_SIZE: usize = 14;

/// A record with a fixed collector-side field layout.
pub trait CompactStruct {
    /// Writes the fields only; the caller brackets them.
    fn write_fields(&self, w: &mut CompactWriter) -> Result<(), EncodeError>;
}

/// The empty struct: just a stop byte on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyStruct;

impl CompactStruct for EmptyStruct {
    fn write_fields(&self, _w: &mut CompactWriter) -> Result<(), EncodeError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CompactWriter {
    buf: BytesMut,
    last_field_id: i16,
    enclosing_field_ids: Vec<i16>,
}

impl CompactWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to an existing buffer, e.g. after a frame header.
    #[must_use]
    pub fn with_buffer(buf: BytesMut) -> Self {
        Self {
            buf,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn write_struct<S: CompactStruct + ?Sized>(&mut self, s: &S) -> Result<(), EncodeError> {
        self.enclosing_field_ids.push(self.last_field_id);
        self.last_field_id = 0;
        s.write_fields(self)?;
        self.buf.put_u8(STOP);
        self.last_field_id = self.enclosing_field_ids.pop().unwrap_or(0);
        Ok(())
    }

    pub fn field_bool(&mut self, id: i16, value: bool) {
        let ty = if value {
            CompactType::BoolTrue
        } else {
            CompactType::BoolFalse
        };
        self.field_header(id, ty);
    }

    pub fn field_byte(&mut self, id: i16, value: i8) {
        self.field_header(id, CompactType::Byte);
        self.buf.put_i8(value);
    }

    pub fn field_i16(&mut self, id: i16, value: i16) {
        self.field_header(id, CompactType::I16);
        self.put_zigzag_i32(i32::from(value));
    }

    pub fn field_i32(&mut self, id: i16, value: i32) {
        self.field_header(id, CompactType::I32);
        self.put_zigzag_i32(value);
    }

    pub fn field_i64(&mut self, id: i16, value: i64) {
        self.field_header(id, CompactType::I64);
        self.put_zigzag_i64(value);
    }

    /// `name` identifies the field in the error if `value` is NaN or infinite.
    pub fn field_double(&mut self, id: i16, name: &'static str, value: f64) -> Result<(), EncodeError> {
        if !value.is_finite() {
            return Err(EncodeError::NonFiniteDouble { field: name, value });
        }
        self.field_header(id, CompactType::Double);
        self.buf.put_f64_le(value);
        Ok(())
    }

    pub fn field_string(&mut self, id: i16, value: &str) -> Result<(), EncodeError> {
        self.field_binary(id, value.as_bytes())
    }

    pub fn field_binary(&mut self, id: i16, value: &[u8]) -> Result<(), EncodeError> {
        check_len("binary", value.len())?;
        self.field_header(id, CompactType::Binary);
        self.put_varint(value.len() as u64);
        self.buf.put_slice(value);
        Ok(())
    }

    pub fn field_struct<S: CompactStruct + ?Sized>(&mut self, id: i16, value: &S) -> Result<(), EncodeError> {
        self.field_header(id, CompactType::Struct);
        self.write_struct(value)
    }

    pub fn field_struct_list<S: CompactStruct>(&mut self, id: i16, values: &[S]) -> Result<(), EncodeError> {
        check_len("list", values.len())?;
        self.field_header(id, CompactType::List);
        self.list_header(values.len(), CompactType::Struct);
        for value in values {
            self.write_struct(value)?;
        }
        Ok(())
    }

    fn field_header(&mut self, id: i16, ty: CompactType) {
        let delta = i32::from(id) - i32::from(self.last_field_id);
        if delta > 0 && delta <= MAX_SHORT_FIELD_DELTA {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            self.buf.put_u8(((delta as u8) << 4) | ty as u8);
        } else {
            self.buf.put_u8(ty as u8);
            self.put_zigzag_i32(i32::from(id));
        }
        self.last_field_id = id;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn list_header(&mut self, size: usize, elem: CompactType) {
        if size <= MAX_SHORT_LIST_SIZE {
            self.buf.put_u8(((size as u8) << 4) | elem as u8);
        } else {
            self.buf.put_u8(0xF0 | elem as u8);
            self.put_varint(size as u64);
        }
    }

    fn put_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            self.buf.put_u8((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.buf.put_u8(value as u8);
    }

    #[allow(clippy::cast_sign_loss)]
    fn put_zigzag_i32(&mut self, value: i32) {
        self.put_varint(u64::from(((value << 1) ^ (value >> 31)) as u32));
    }

    #[allow(clippy::cast_sign_loss)]
    fn put_zigzag_i64(&mut self, value: i64) {
        self.put_varint(((value << 1) ^ (value >> 63)) as u64);
    }
}

fn check_len(what: &'static str, len: usize) -> Result<(), EncodeError> {
    if i32::try_from(len).is_err() {
        return Err(EncodeError::LengthOverflow { what, len });
    }
    Ok(())
}

/// Minimal decoder used by tests to inspect encoded records.
#[cfg(test)]
pub(crate) mod reader {
    use super::CompactType;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Value {
        Bool(bool),
        Byte(i8),
        I16(i16),
        I32(i32),
        I64(i64),
        Double(f64),
        Binary(Vec<u8>),
        List(Vec<Value>),
        Struct(Vec<(i16, Value)>),
    }

    impl Value {
        pub(crate) fn field(&self, id: i16) -> Option<&Value> {
            match self {
                Value::Struct(fields) => fields.iter().find(|(f, _)| *f == id).map(|(_, v)| v),
                _ => None,
            }
        }

        pub(crate) fn as_i64(&self) -> i64 {
            match self {
                Value::I16(v) => i64::from(*v),
                Value::I32(v) => i64::from(*v),
                Value::I64(v) => *v,
                Value::Byte(v) => i64::from(*v),
                other => panic!("not an integer: {other:?}"),
            }
        }

        pub(crate) fn as_str(&self) -> &str {
            match self {
                Value::Binary(b) => std::str::from_utf8(b).expect("utf8"),
                other => panic!("not a string: {other:?}"),
            }
        }

        pub(crate) fn as_list(&self) -> &[Value] {
            match self {
                Value::List(items) => items,
                other => panic!("not a list: {other:?}"),
            }
        }
    }

    pub(crate) struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        pub(crate) fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        pub(crate) fn remaining(&self) -> usize {
            self.buf.len() - self.pos
        }

        fn byte(&mut self) -> u8 {
            let b = self.buf[self.pos];
            self.pos += 1;
            b
        }

        fn varint(&mut self) -> u64 {
            let mut value = 0u64;
            let mut shift = 0;
            loop {
                let b = self.byte();
                value |= u64::from(b & 0x7F) << shift;
                if b & 0x80 == 0 {
                    return value;
                }
                shift += 7;
            }
        }

        fn zigzag(&mut self) -> i64 {
            let v = self.varint();
            ((v >> 1) as i64) ^ -((v & 1) as i64)
        }

        pub(crate) fn read_struct(&mut self) -> Value {
            let mut fields = Vec::new();
            let mut last: i16 = 0;
            loop {
                let header = self.byte();
                if header == 0 {
                    return Value::Struct(fields);
                }
                let ty = header & 0x0F;
                let delta = header >> 4;
                let id = if delta == 0 {
                    self.zigzag() as i16
                } else {
                    last + i16::from(delta)
                };
                last = id;
                let value = match ty {
                    t if t == CompactType::BoolTrue as u8 => Value::Bool(true),
                    t if t == CompactType::BoolFalse as u8 => Value::Bool(false),
                    t => self.read_value(t),
                };
                fields.push((id, value));
            }
        }

        fn read_value(&mut self, ty: u8) -> Value {
            match ty {
                3 => Value::Byte(self.byte() as i8),
                4 => Value::I16(self.zigzag() as i16),
                5 => Value::I32(self.zigzag() as i32),
                6 => Value::I64(self.zigzag()),
                7 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
                    self.pos += 8;
                    Value::Double(f64::from_le_bytes(raw))
                }
                8 => {
                    let len = self.varint() as usize;
                    let bytes = self.buf[self.pos..self.pos + len].to_vec();
                    self.pos += len;
                    Value::Binary(bytes)
                }
                9 => {
                    let header = self.byte();
                    let elem = header & 0x0F;
                    let size = match header >> 4 {
                        0x0F => self.varint() as usize,
                        short => usize::from(short),
                    };
                    Value::List((0..size).map(|_| self.read_value(elem)).collect())
                }
                12 => self.read_struct(),
                other => panic!("unsupported compact type {other}"),
            }
        }
    }

    pub(crate) fn decode_struct(buf: &[u8]) -> Value {
        let mut reader = Reader::new(buf);
        let value = reader.read_struct();
        assert_eq!(reader.remaining(), 0, "trailing bytes after struct");
        value
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span record layout: a finished transaction with its segments as span
//! events.
//!
//! Segments are flattened in pre-order of the segment tree. Siblings keep
//! span id order, so two segments started concurrently under one parent
//! are ordered by which one took its span id first. Each event carries its
//! pre-order index as `sequence` and its tree depth (1 directly below the
//! root) as `depth`.

use std::collections::HashMap;
use std::time::SystemTime;

use bytes::{BufMut, BytesMut};

use super::compact::{CompactStruct, CompactWriter};
use super::AgentIdentity;
use crate::attribute::{self, AttributeValue};
use crate::error::EncodeError;
use crate::trace_id::TraceId;
use crate::transaction::{SegmentRecord, TransactionRecord};

/// Annotation keys the collector knows.
pub mod annotation_key {
    pub const API: i32 = 12;
    pub const RETURN_DATA: i32 = 14;
    pub const SQL_ID: i32 = 20;
    pub const SQL: i32 = 21;
    pub const SQL_PARAM: i32 = 23;
    pub const SQL_BIND_VALUE: i32 = 24;
    pub const HTTP_URL: i32 = 40;
    pub const HTTP_STATUS_CODE: i32 = 46;
    pub const EXCEPTION: i32 = -50;
    pub const EXCEPTION_CLASS: i32 = -51;
    /// Generic `name=value` argument.
    pub const ARGS: i32 = -11;
    pub const API_TAG: i32 = 10015;
}

/// Service type of a span event produced by a plain method segment.
pub const METHOD_SERVICE_TYPE: i16 = 0;

const TRANSACTION_ID_VERSION: u8 = 0;

fn annotation_key_for(name: &str) -> Option<i32> {
    let key = match name {
        attribute::API => annotation_key::API,
        attribute::RETURN_DATA => annotation_key::RETURN_DATA,
        attribute::SQL_ID => annotation_key::SQL_ID,
        attribute::SQL => annotation_key::SQL,
        attribute::SQL_PARAM => annotation_key::SQL_PARAM,
        attribute::SQL_BIND_VALUE => annotation_key::SQL_BIND_VALUE,
        attribute::HTTP_URL => annotation_key::HTTP_URL,
        attribute::HTTP_STATUS_CODE => annotation_key::HTTP_STATUS_CODE,
        attribute::EXCEPTION => annotation_key::EXCEPTION,
        attribute::EXCEPTION_CLASS => annotation_key::EXCEPTION_CLASS,
        attribute::API_TAG => annotation_key::API_TAG,
        _ => return None,
    };
    Some(key)
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    String(String),
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
}

impl From<&AttributeValue> for AnnotationValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => AnnotationValue::String(s.clone()),
            AttributeValue::Bool(b) => AnnotationValue::Bool(*b),
            AttributeValue::Int(i) => match i32::try_from(*i) {
                Ok(small) => AnnotationValue::Int(small),
                Err(_) => AnnotationValue::Long(*i),
            },
            AttributeValue::Float(f) => AnnotationValue::Double(*f),
        }
    }
}

impl CompactStruct for AnnotationValue {
    fn write_fields(&self, w: &mut CompactWriter) -> Result<(), EncodeError> {
        match self {
            AnnotationValue::String(s) => w.field_string(1, s)?,
            AnnotationValue::Bool(b) => w.field_bool(2, *b),
            AnnotationValue::Int(i) => w.field_i32(3, *i),
            AnnotationValue::Long(l) => w.field_i64(4, *l),
            AnnotationValue::Double(d) => w.field_double(6, "doubleValue", *d)?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub key: i32,
    pub value: AnnotationValue,
}

impl CompactStruct for Annotation {
    fn write_fields(&self, w: &mut CompactWriter) -> Result<(), EncodeError> {
        w.field_i32(1, self.key);
        w.field_struct(2, &self.value)
    }
}

impl Annotation {
    pub fn from_attribute(name: &str, value: &AttributeValue) -> Result<Self, EncodeError> {
        if let AttributeValue::Float(f) = value {
            if !f.is_finite() {
                return Err(EncodeError::NonFiniteDouble {
                    field: "annotation",
                    value: *f,
                });
            }
        }
        Ok(match annotation_key_for(name) {
            Some(key) => Annotation {
                key,
                value: AnnotationValue::from(value),
            },
            None => Annotation {
                key: annotation_key::ARGS,
                value: AnnotationValue::String(format!("{name}={value}")),
            },
        })
    }
}

/// Annotations for an attribute map, ordered by attribute name.
pub fn annotations(
    attributes: &HashMap<String, AttributeValue>,
) -> Result<Vec<Annotation>, EncodeError> {
    let mut names: Vec<&String> = attributes.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| Annotation::from_attribute(name, &attributes[name]))
        .collect()
}

/// Binary transaction id: version byte, zigzag length-prefixed agent id,
/// then start time and sequence as unsigned varints.
#[must_use]
pub fn transaction_id_bytes(trace_id: &TraceId) -> Vec<u8> {
    let agent_id = trace_id.agent_id.as_bytes();
    let mut buf = BytesMut::with_capacity(agent_id.len() + 24);
    buf.put_u8(TRANSACTION_ID_VERSION);
    #[allow(clippy::cast_possible_wrap)]
    let len = agent_id.len() as i64;
    put_varint(&mut buf, ((len << 1) ^ (len >> 63)) as u64);
    buf.put_slice(agent_id);
    #[allow(clippy::cast_sign_loss)]
    let (start_time, sequence_id) = (trace_id.start_time as u64, trace_id.sequence_id as u64);
    put_varint(&mut buf, start_time);
    put_varint(&mut buf, sequence_id);
    buf.to_vec()
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8(value as u8);
}

fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Millis from `from` to `to`, zero if the clock went backwards.
fn elapsed_millis(from: SystemTime, to: SystemTime) -> i32 {
    to.duration_since(from)
        .map_or(0, |d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub span_id: i64,
    pub sequence: i16,
    pub start_elapsed: i32,
    pub end_elapsed: i32,
    pub service_type: i16,
    pub annotations: Vec<Annotation>,
    pub depth: i32,
    pub next_span_id: Option<i64>,
}

impl CompactStruct for SpanEvent {
    fn write_fields(&self, w: &mut CompactWriter) -> Result<(), EncodeError> {
        w.field_i64(7, self.span_id);
        w.field_i16(8, self.sequence);
        w.field_i32(9, self.start_elapsed);
        w.field_i32(10, self.end_elapsed);
        w.field_i16(12, self.service_type);
        w.field_struct_list(14, &self.annotations)?;
        w.field_i32(15, self.depth);
        if let Some(next_span_id) = self.next_span_id {
            w.field_i64(16, next_span_id);
        }
        Ok(())
    }
}

/// Flattens the segment tree of `record` into span events.
pub fn span_events(record: &TransactionRecord) -> Result<Vec<SpanEvent>, EncodeError> {
    let known: std::collections::HashSet<i64> =
        record.segments.iter().map(|s| s.span_id).collect();

    let mut children: HashMap<i64, Vec<&SegmentRecord>> = HashMap::new();
    let mut roots = Vec::new();
    for segment in &record.segments {
        if segment.parent_span_id != segment.span_id && known.contains(&segment.parent_span_id) {
            children.entry(segment.parent_span_id).or_default().push(segment);
        } else {
            roots.push(segment);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|s| s.span_id);
    }
    roots.sort_by_key(|s| s.span_id);

    let mut events = Vec::with_capacity(record.segments.len());
    let mut stack: Vec<(&SegmentRecord, i32)> = roots.into_iter().rev().map(|s| (s, 1)).collect();
    while let Some((segment, depth)) = stack.pop() {
        let sequence = i16::try_from(events.len()).map_err(|_| EncodeError::LengthOverflow {
            what: "span event sequence",
            len: events.len(),
        })?;
        events.push(span_event(record, segment, sequence, depth)?);
        if let Some(kids) = children.get(&segment.span_id) {
            stack.extend(kids.iter().rev().map(|kid| (*kid, depth + 1)));
        }
    }
    Ok(events)
}

fn span_event(
    record: &TransactionRecord,
    segment: &SegmentRecord,
    sequence: i16,
    depth: i32,
) -> Result<SpanEvent, EncodeError> {
    let end_time = segment.end_time.unwrap_or(record.end_time);
    let mut annotations = Vec::with_capacity(segment.attributes.len() + 1);
    if !segment.attributes.contains_key(attribute::API) {
        annotations.push(Annotation {
            key: annotation_key::API,
            value: AnnotationValue::String(segment.name.clone()),
        });
    }
    annotations.extend(self::annotations(&segment.attributes)?);

    Ok(SpanEvent {
        span_id: segment.span_id,
        sequence,
        start_elapsed: elapsed_millis(record.start_time, segment.start_time),
        end_elapsed: elapsed_millis(segment.start_time, end_time),
        service_type: METHOD_SERVICE_TYPE,
        annotations,
        depth,
        next_span_id: segment.next_span_id,
    })
}

/// A transaction record ready to be written, with the sender's identity.
#[derive(Debug)]
pub struct Span {
    pub agent: AgentIdentity,
    pub transaction_id: Vec<u8>,
    pub span_id: i64,
    pub parent_span_id: i64,
    pub start_time: i64,
    pub elapsed: i32,
    pub rpc: String,
    pub annotations: Vec<Annotation>,
    pub flag: i16,
    pub err: Option<i32>,
    pub span_events: Vec<SpanEvent>,
    pub parent_application_name: Option<String>,
    pub parent_application_type: Option<i16>,
}

impl Span {
    pub fn new(agent: &AgentIdentity, record: &TransactionRecord) -> Result<Self, EncodeError> {
        Ok(Self {
            agent: agent.clone(),
            transaction_id: transaction_id_bytes(&record.trace_id),
            span_id: record.span_id,
            parent_span_id: record.parent_span_id,
            start_time: epoch_millis(record.start_time),
            elapsed: elapsed_millis(record.start_time, record.end_time),
            rpc: record.name.clone(),
            annotations: annotations(&record.attributes)?,
            flag: record.flags,
            err: record.error.as_ref().map(|_| 1),
            span_events: span_events(record)?,
            parent_application_name: record.parent_app_name.clone(),
            parent_application_type: record.parent_app_type,
        })
    }
}

impl CompactStruct for Span {
    fn write_fields(&self, w: &mut CompactWriter) -> Result<(), EncodeError> {
        w.field_string(1, &self.agent.agent_id)?;
        w.field_string(2, &self.agent.app_name)?;
        w.field_i64(3, self.agent.agent_start_time);
        w.field_binary(4, &self.transaction_id)?;
        w.field_i64(7, self.span_id);
        w.field_i64(8, self.parent_span_id);
        w.field_i64(9, self.start_time);
        w.field_i32(10, self.elapsed);
        w.field_string(11, &self.rpc)?;
        w.field_i16(12, self.agent.service_type);
        if !self.annotations.is_empty() {
            w.field_struct_list(15, &self.annotations)?;
        }
        w.field_i16(16, self.flag);
        if let Some(err) = self.err {
            w.field_i32(17, err);
        }
        if !self.span_events.is_empty() {
            w.field_struct_list(18, &self.span_events)?;
        }
        if let Some(name) = &self.parent_application_name {
            w.field_string(19, name)?;
        }
        if let Some(app_type) = self.parent_application_type {
            w.field_i16(20, app_type);
        }
        Ok(())
    }
}

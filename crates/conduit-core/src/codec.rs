//! Canonical binary encoding for [`Value`] and [`Message`] (§6).
//!
//! The encoding is a simple tag-prefixed format: every value starts with a
//! one-byte kind tag, lengths are explicit `u32` counts, and integers/floats
//! are big-endian. This makes the wire form stable across processes
//! regardless of native word size or byte order, which is the only
//! portability requirement the spec places on it (§6) — there is
//! deliberately no attempt at a compact or self-optimising representation.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::address::{Address, AddressError};
use crate::message::{Message, ReplyOutcome, RequestId};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer ended before a complete value could be decoded")]
    Truncated,
    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),
    #[error("unknown message tag {0}")]
    UnknownMessageTag(u8),
    #[error("string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("malformed address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("frame of {actual} bytes exceeds the configured maximum of {max} bytes")]
    FrameTooLarge { actual: u32, max: u32 },
}

const VAL_NULL: u8 = 0;
const VAL_BOOL: u8 = 1;
const VAL_INT: u8 = 2;
const VAL_FLOAT: u8 = 3;
const VAL_BYTES: u8 = 4;
const VAL_STR: u8 = 5;
const VAL_LIST: u8 = 6;
const VAL_MAP: u8 = 7;
const VAL_RECORD: u8 = 8;
const VAL_TIMESTAMP: u8 = 9;

const MSG_REQUEST: u8 = 1;
const MSG_REPLY_VALUE: u8 = 2;
const MSG_REPLY_EXCEPTION: u8 = 3;
const MSG_ERROR_REPLY: u8 = 4;
const MSG_SIGNAL: u8 = 5;
const MSG_HANDSHAKE: u8 = 6;

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> Result<String, CodecError> {
    let bytes = get_bytes_vec(buf)?;
    Ok(String::from_utf8(bytes)?)
}

fn get_bytes_vec(buf: &mut impl Buf) -> Result<Vec<u8>, CodecError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut impl Buf) -> Result<i64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_i64())
}

fn get_f64(buf: &mut impl Buf) -> Result<f64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_f64())
}

pub fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(VAL_NULL),
        Value::Bool(b) => {
            buf.put_u8(VAL_BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int(i) => {
            buf.put_u8(VAL_INT);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(VAL_FLOAT);
            buf.put_f64(*f);
        }
        Value::Bytes(b) => {
            buf.put_u8(VAL_BYTES);
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Str(s) => {
            buf.put_u8(VAL_STR);
            put_str(buf, s);
        }
        Value::List(items) => {
            buf.put_u8(VAL_LIST);
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(item, buf);
            }
        }
        Value::Map(map) => {
            buf.put_u8(VAL_MAP);
            encode_map(map, buf);
        }
        Value::Record { tag, fields } => {
            buf.put_u8(VAL_RECORD);
            put_str(buf, tag);
            encode_map(fields, buf);
        }
        Value::Timestamp { secs, nanos } => {
            buf.put_u8(VAL_TIMESTAMP);
            buf.put_i64(*secs);
            buf.put_u32(*nanos);
        }
    }
}

fn encode_map(map: &BTreeMap<String, Value>, buf: &mut BytesMut) {
    buf.put_u32(map.len() as u32);
    // BTreeMap iterates in key order, which is exactly what makes the
    // encoding of a map canonical (§6) rather than dependent on insertion order.
    for (key, value) in map {
        put_str(buf, key);
        encode_value(value, buf);
    }
}

fn decode_map(buf: &mut impl Buf) -> Result<BTreeMap<String, Value>, CodecError> {
    let len = get_u32(buf)?;
    let mut map = BTreeMap::new();
    for _ in 0..len {
        let key = get_str(buf)?;
        let value = decode_value(buf)?;
        map.insert(key, value);
    }
    Ok(map)
}

pub fn decode_value(buf: &mut impl Buf) -> Result<Value, CodecError> {
    let tag = get_u8(buf)?;
    Ok(match tag {
        VAL_NULL => Value::Null,
        VAL_BOOL => Value::Bool(get_u8(buf)? != 0),
        VAL_INT => Value::Int(get_i64(buf)?),
        VAL_FLOAT => Value::Float(get_f64(buf)?),
        VAL_BYTES => Value::Bytes(get_bytes_vec(buf)?),
        VAL_STR => Value::Str(get_str(buf)?),
        VAL_LIST => {
            let len = get_u32(buf)?;
            let mut items = Vec::with_capacity(len.min(1 << 16) as usize);
            for _ in 0..len {
                items.push(decode_value(buf)?);
            }
            Value::List(items)
        }
        VAL_MAP => Value::Map(decode_map(buf)?),
        VAL_RECORD => {
            let tag = get_str(buf)?;
            let fields = decode_map(buf)?;
            Value::Record { tag, fields }
        }
        VAL_TIMESTAMP => {
            let secs = get_i64(buf)?;
            let nanos = get_u32(buf)?;
            Value::Timestamp { secs, nanos }
        }
        other => return Err(CodecError::UnknownValueTag(other)),
    })
}

fn encode_address(address: &Address, buf: &mut BytesMut) {
    put_str(buf, address.context());
    put_str(buf, address.object());
}

fn decode_address(buf: &mut impl Buf) -> Result<Address, CodecError> {
    let context = get_str(buf)?;
    let object = get_str(buf)?;
    Ok(Address::new(context, object)?)
}

pub fn encode_message(message: &Message) -> BytesMut {
    let mut buf = BytesMut::new();
    match message {
        Message::Request {
            source,
            destination,
            request_id,
            method,
            args,
            kwargs,
            lock_token,
        } => {
            buf.put_u8(MSG_REQUEST);
            encode_address(source, &mut buf);
            encode_address(destination, &mut buf);
            buf.put_u64(*request_id);
            put_str(&mut buf, method);
            buf.put_u32(args.len() as u32);
            for arg in args {
                encode_value(arg, &mut buf);
            }
            encode_map(kwargs, &mut buf);
            match lock_token {
                Some(token) => {
                    buf.put_u8(1);
                    put_str(&mut buf, token);
                }
                None => buf.put_u8(0),
            }
        }
        Message::Reply { source, destination, request_id, outcome } => {
            match outcome {
                ReplyOutcome::Value(value) => {
                    buf.put_u8(MSG_REPLY_VALUE);
                    encode_address(source, &mut buf);
                    encode_address(destination, &mut buf);
                    buf.put_u64(*request_id);
                    encode_value(value, &mut buf);
                }
                ReplyOutcome::Exception(exc) => {
                    buf.put_u8(MSG_REPLY_EXCEPTION);
                    encode_address(source, &mut buf);
                    encode_address(destination, &mut buf);
                    buf.put_u64(*request_id);
                    encode_value(&exc.to_record(), &mut buf);
                }
            }
        }
        Message::ErrorReply { source, destination, request_id, kind, message } => {
            buf.put_u8(MSG_ERROR_REPLY);
            encode_address(source, &mut buf);
            encode_address(destination, &mut buf);
            buf.put_u64(*request_id);
            put_str(&mut buf, kind);
            put_str(&mut buf, message);
        }
        Message::Signal { source, destination, signal, timestamp_secs, timestamp_nanos, payload } => {
            buf.put_u8(MSG_SIGNAL);
            encode_address(source, &mut buf);
            encode_address(destination, &mut buf);
            put_str(&mut buf, signal);
            buf.put_i64(*timestamp_secs);
            buf.put_u32(*timestamp_nanos);
            encode_value(payload, &mut buf);
        }
        Message::Handshake { source, destination, peer_context, workgroup, protocol_version } => {
            buf.put_u8(MSG_HANDSHAKE);
            encode_address(source, &mut buf);
            encode_address(destination, &mut buf);
            put_str(&mut buf, peer_context);
            put_str(&mut buf, workgroup);
            buf.put_u32(*protocol_version);
        }
    }
    buf
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let tag = get_u8(&mut buf)?;
    Ok(match tag {
        MSG_REQUEST => {
            let source = decode_address(&mut buf)?;
            let destination = decode_address(&mut buf)?;
            let request_id: RequestId = get_u64(&mut buf)?;
            let method = get_str(&mut buf)?;
            let arg_count = get_u32(&mut buf)?;
            let mut args = Vec::with_capacity(arg_count.min(1 << 16) as usize);
            for _ in 0..arg_count {
                args.push(decode_value(&mut buf)?);
            }
            let kwargs = decode_map(&mut buf)?;
            let lock_token = if get_u8(&mut buf)? == 1 {
                Some(get_str(&mut buf)?)
            } else {
                None
            };
            Message::Request { source, destination, request_id, method, args, kwargs, lock_token }
        }
        MSG_REPLY_VALUE => {
            let source = decode_address(&mut buf)?;
            let destination = decode_address(&mut buf)?;
            let request_id = get_u64(&mut buf)?;
            let value = decode_value(&mut buf)?;
            Message::Reply { source, destination, request_id, outcome: ReplyOutcome::Value(value) }
        }
        MSG_REPLY_EXCEPTION => {
            let source = decode_address(&mut buf)?;
            let destination = decode_address(&mut buf)?;
            let request_id = get_u64(&mut buf)?;
            let record = decode_value(&mut buf)?;
            let exc = crate::error::RemoteException::from_record(&record).ok_or(CodecError::Truncated)?;
            Message::Reply { source, destination, request_id, outcome: ReplyOutcome::Exception(exc) }
        }
        MSG_ERROR_REPLY => {
            let source = decode_address(&mut buf)?;
            let destination = decode_address(&mut buf)?;
            let request_id = get_u64(&mut buf)?;
            let kind = get_str(&mut buf)?;
            let message = get_str(&mut buf)?;
            Message::ErrorReply { source, destination, request_id, kind, message }
        }
        MSG_SIGNAL => {
            let source = decode_address(&mut buf)?;
            let destination = decode_address(&mut buf)?;
            let signal = get_str(&mut buf)?;
            let timestamp_secs = get_i64(&mut buf)?;
            let timestamp_nanos = get_u32(&mut buf)?;
            let payload = decode_value(&mut buf)?;
            Message::Signal { source, destination, signal, timestamp_secs, timestamp_nanos, payload }
        }
        MSG_HANDSHAKE => {
            let source = decode_address(&mut buf)?;
            let destination = decode_address(&mut buf)?;
            let peer_context = get_str(&mut buf)?;
            let workgroup = get_str(&mut buf)?;
            let protocol_version = get_u32(&mut buf)?;
            Message::Handshake { source, destination, peer_context, workgroup, protocol_version }
        }
        other => return Err(CodecError::UnknownMessageTag(other)),
    })
}

/// Prefixes `payload` with its big-endian `u32` length (§6's TCP framing).
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.put_slice(payload);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn addr(ctx: &str, obj: &str) -> Address {
        Address::new(ctx, obj).unwrap()
    }

    #[test]
    fn value_round_trips_through_every_kind() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_owned(), Value::Int(1));
        fields.insert("b".to_owned(), Value::Str("x".into()));
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(1.5),
            Value::Bytes(vec![1, 2, 3]),
            Value::Str("hello".into()),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            Value::Map(fields.clone()),
            Value::Record { tag: "ex".into(), fields },
            Value::Timestamp { secs: 10, nanos: 20 },
        ];
        for value in values {
            let mut buf = BytesMut::new();
            encode_value(&value, &mut buf);
            let mut cursor = Bytes::copy_from_slice(&buf);
            let decoded = decode_value(&mut cursor).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn request_message_round_trips() {
        let msg = Message::request(
            addr("a", "__proxy__"),
            addr("a", "svc"),
            "add",
            vec![Value::Int(2), Value::Int(3)],
            BTreeMap::new(),
            None,
        );
        let encoded = encode_message(&msg);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_buffer_is_rejected_not_panicking() {
        let msg = Message::request(addr("a", "x"), addr("a", "svc"), "m", vec![], BTreeMap::new(), None);
        let encoded = encode_message(&msg);
        let truncated = &encoded[..encoded.len() - 2];
        assert!(decode_message(truncated).is_err());
    }
}

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::address::Address;
use crate::error::RemoteException;
use crate::value::Value;

/// A 64-bit request identifier, random per §3 so that collisions across a
/// process's lifetime are astronomically unlikely without needing a shared
/// counter (which would otherwise have to be synchronised across every
/// proxy in the process).
pub type RequestId = u64;

pub fn new_request_id() -> RequestId {
    rand::thread_rng().next_u64()
}

/// Either half of a call's outcome: a returned value, or a preserved
/// service-side exception (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Value(Value),
    Exception(RemoteException),
}

/// The discriminated message carried end-to-end by the router and, for
/// remote destinations, framed onto a peer connection (§3, §6).
///
/// Every variant carries both a source and destination [`Address`] — the
/// router rejects anything that doesn't (§3 invariants) before it ever
/// reaches a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        source: Address,
        destination: Address,
        request_id: RequestId,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        lock_token: Option<String>,
    },
    Reply {
        source: Address,
        destination: Address,
        request_id: RequestId,
        outcome: ReplyOutcome,
    },
    /// A transport/protocol-level error distinct from an application
    /// exception (§3) — e.g. `UnknownReceiver`, `UnknownMethod`, `Locked`.
    ErrorReply {
        source: Address,
        destination: Address,
        request_id: RequestId,
        kind: String,
        message: String,
    },
    Signal {
        source: Address,
        destination: Address,
        signal: String,
        timestamp_secs: i64,
        timestamp_nanos: u32,
        payload: Value,
    },
    Handshake {
        source: Address,
        destination: Address,
        peer_context: String,
        workgroup: String,
        protocol_version: u32,
    },
}

impl Message {
    pub fn source(&self) -> &Address {
        match self {
            Message::Request { source, .. }
            | Message::Reply { source, .. }
            | Message::ErrorReply { source, .. }
            | Message::Signal { source, .. }
            | Message::Handshake { source, .. } => source,
        }
    }

    pub fn destination(&self) -> &Address {
        match self {
            Message::Request { destination, .. }
            | Message::Reply { destination, .. }
            | Message::ErrorReply { destination, .. }
            | Message::Signal { destination, .. }
            | Message::Handshake { destination, .. } => destination,
        }
    }

    pub fn request(
        source: Address,
        destination: Address,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        lock_token: Option<String>,
    ) -> Self {
        Message::Request {
            source,
            destination,
            request_id: new_request_id(),
            method: method.into(),
            args,
            kwargs,
            lock_token,
        }
    }

    pub fn error_reply(
        source: Address,
        destination: Address,
        request_id: RequestId,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Message::ErrorReply {
            source,
            destination,
            request_id,
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn signal_now(source: Address, destination: Address, signal: impl Into<String>, payload: Value) -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Message::Signal {
            source,
            destination,
            signal: signal.into(),
            timestamp_secs: now.as_secs() as i64,
            timestamp_nanos: now.subsec_nanos(),
            payload,
        }
    }
}

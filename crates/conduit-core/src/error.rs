use std::borrow::Cow;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::value::Value;

/// The error taxonomy propagated through the protocol (§7).
///
/// Every variant maps to a stable `&'static str` kind tag via [`RuntimeError::kind`]
/// so that the identity of the error survives a round trip over the wire even
/// when the receiving process is running a different implementation of this
/// protocol (§9, "remote-exception fidelity across languages").
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("no handler registered for `{address}`")]
    UnknownReceiver { address: String },

    #[error("service `{service}` has no method named `{method}`")]
    UnknownMethod { service: String, method: String },

    #[error("context `{context}` is neither local nor reachable")]
    UnknownPeer { context: String },

    #[error("service `{service}` is locked")]
    Locked { service: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A service-side exception, preserving the originating kind string so
    /// that an unknown kind can still be reported faithfully even though the
    /// local process has no corresponding native error type.
    #[error("application error ({kind}): {message}")]
    ApplicationError {
        kind: String,
        message: String,
        descriptor: Option<Value>,
    },

    #[error("call timed out")]
    Timeout,

    #[error("peer connection lost before reply")]
    PeerLost,

    #[error("handshake failed: {message}")]
    ProtocolMismatch { message: String },

    #[error("loop task overran its period")]
    Overrun,

    #[error("illegal state: {message}")]
    IllegalState { message: String },
}

impl RuntimeError {
    /// The stable identifier carried across the wire in a reply's
    /// remote-exception payload or in an error-reply message.
    pub fn kind(&self) -> Cow<'_, str> {
        match self {
            RuntimeError::UnknownReceiver { .. } => Cow::Borrowed("UnknownReceiver"),
            RuntimeError::UnknownMethod { .. } => Cow::Borrowed("UnknownMethod"),
            RuntimeError::UnknownPeer { .. } => Cow::Borrowed("UnknownPeer"),
            RuntimeError::Locked { .. } => Cow::Borrowed("Locked"),
            RuntimeError::InvalidArgument { .. } => Cow::Borrowed("InvalidArgument"),
            RuntimeError::ApplicationError { kind, .. } => Cow::Borrowed(kind.as_str()),
            RuntimeError::Timeout => Cow::Borrowed("Timeout"),
            RuntimeError::PeerLost => Cow::Borrowed("PeerLost"),
            RuntimeError::ProtocolMismatch { .. } => Cow::Borrowed("ProtocolMismatch"),
            RuntimeError::Overrun => Cow::Borrowed("Overrun"),
            RuntimeError::IllegalState { .. } => Cow::Borrowed("IllegalState"),
        }
    }

    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::ApplicationError {
            kind: kind.into(),
            message: message.into(),
            descriptor: None,
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        RuntimeError::IllegalState { message: message.into() }
    }

    /// Renders the error as the `(kind, message, descriptor)` triple carried
    /// by a reply's remote-exception payload (§3).
    pub fn to_remote_exception(&self) -> RemoteException {
        let descriptor = match self {
            RuntimeError::ApplicationError { descriptor, .. } => descriptor.clone(),
            _ => None,
        };
        RemoteException {
            kind: self.kind().into_owned(),
            message: self.to_string(),
            descriptor,
        }
    }

    /// Reconstructs a local error from a remote-exception payload, mapping
    /// known kind strings back to their native variant and falling back to
    /// `ApplicationError` for anything unrecognised (§9).
    pub fn from_remote_exception(exc: RemoteException) -> Self {
        match exc.kind.as_str() {
            "UnknownPeer" => RuntimeError::UnknownPeer { context: exc.message },
            "Locked" => RuntimeError::Locked { service: exc.message },
            "InvalidArgument" => RuntimeError::InvalidArgument { message: exc.message },
            "Timeout" => RuntimeError::Timeout,
            "PeerLost" => RuntimeError::PeerLost,
            "ProtocolMismatch" => RuntimeError::ProtocolMismatch { message: exc.message },
            "Overrun" => RuntimeError::Overrun,
            "IllegalState" => RuntimeError::IllegalState { message: exc.message },
            _ => RuntimeError::ApplicationError {
                kind: exc.kind,
                message: exc.message,
                descriptor: exc.descriptor,
            },
        }
    }
}

/// The wire payload of a failed call: an error kind, a human message, and an
/// optional structured descriptor. This is what actually crosses the network;
/// [`RuntimeError`] is the process-local representation either side maps it to.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
    pub descriptor: Option<Value>,
}

impl RemoteException {
    pub fn to_record(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("kind".to_owned(), Value::Str(self.kind.clone()));
        fields.insert("message".to_owned(), Value::Str(self.message.clone()));
        if let Some(descriptor) = &self.descriptor {
            fields.insert("descriptor".to_owned(), descriptor.clone());
        }
        Value::record("remote_exception", fields)
    }

    pub fn from_record(value: &Value) -> Option<Self> {
        let (tag, fields) = value.as_record()?;
        if tag != "remote_exception" {
            return None;
        }
        let kind = fields.get("kind")?.as_str()?.to_owned();
        let message = fields.get("message")?.as_str()?.to_owned();
        let descriptor = fields.get("descriptor").cloned();
        Some(Self { kind, message, descriptor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kind_round_trips_to_native_variant() {
        let original = RuntimeError::Locked { service: "a.svc".into() };
        let exc = original.to_remote_exception();
        assert_eq!(exc.kind, "Locked");
        let restored = RuntimeError::from_remote_exception(exc);
        assert!(matches!(restored, RuntimeError::Locked { .. }));
    }

    #[test]
    fn unknown_kind_falls_back_to_application_error() {
        let exc = RemoteException {
            kind: "SomeOtherLanguageSpecificError".into(),
            message: "boom".into(),
            descriptor: None,
        };
        let restored = RuntimeError::from_remote_exception(exc);
        match restored {
            RuntimeError::ApplicationError { kind, .. } => {
                assert_eq!(kind, "SomeOtherLanguageSpecificError");
            }
            other => panic!("expected ApplicationError, got {other:?}"),
        }
    }

    #[test]
    fn remote_exception_record_round_trips() {
        let exc = RemoteException {
            kind: "ApplicationError".into(),
            message: "bad device state".into(),
            descriptor: Some(Value::Int(7)),
        };
        let record = exc.to_record();
        assert_eq!(RemoteException::from_record(&record).unwrap(), exc);
    }
}

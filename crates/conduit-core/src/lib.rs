//! `conduit-core`: the wire data model, addressing, canonical encoding, and
//! the cancellable-worker primitive shared by every other crate in the
//! workspace.
//!
//! This crate knows nothing about sockets, threads pools of services, or
//! discovery — it is the vocabulary the transport and runtime crates share,
//! kept small enough to unit-test in isolation (see each module's `tests`).

pub mod address;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod value;
pub mod worker;

pub mod prelude {
    pub use crate::address::{Address, AddressError, CONTEXT_OBJECT, SIGNAL_MANAGER_OBJECT};
    pub use crate::config::{ContextConfig, PROTOCOL_VERSION};
    pub use crate::error::{RemoteException, RuntimeError};
    pub use crate::message::{Message, ReplyOutcome, RequestId};
    pub use crate::value::Value;
    pub use crate::worker::{CancellableWorker, StopToken};
}

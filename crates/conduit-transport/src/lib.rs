//! `conduit-transport`: TCP peer connections and UDP workgroup discovery,
//! multiplexed from a single socket-manager worker (§4.3).
//!
//! Everything in this crate speaks [`conduit_core::message::Message`] and
//! knows nothing about the handler table, locking, or signal fan-out those
//! messages eventually feed — that is `conduit-runtime`'s job.

pub mod error;
pub mod socket_manager;
pub mod tcp;
pub mod udp;

pub use error::TransportError;
pub use socket_manager::{InboundHandler, PeerLostHandler, SocketManager};

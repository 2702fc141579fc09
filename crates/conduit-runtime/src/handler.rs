//! The trait every address-registered participant implements so the router
//! can deliver to it without knowing what it is (§4.2).

use conduit_core::message::Message;

/// Something registered at an [`Address`](conduit_core::address::Address)
/// that the router can hand a [`Message`] to.
///
/// Delivery is always synchronous from the router's point of view: `handle`
/// must not block on network I/O (only the socket manager does that) and
/// should hand off to its own worker queue if the work is more than a quick
/// match-and-enqueue.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message);

    /// Called when a peer context this handler had been told it was waiting
    /// on (via [`crate::router::MessageRouter::track_pending`]) disconnects
    /// before answering. Only pending-call futures override this; every
    /// other handler is indifferent to peer churn it didn't ask to hear about.
    fn on_peer_lost(&self, _peer_context: &str) {}
}

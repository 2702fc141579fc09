//! The message router (§4.2): the single point through which every message
//! passes, whether its destination turns out to be local or remote.
//!
//! Local delivery never touches the network or the codec — the router looks
//! up the destination in its handler table and calls [`MessageHandler::handle`]
//! directly on the caller's thread. Remote delivery hands the message to the
//! [`SocketManager`], connecting to the destination context on demand if it
//! isn't already reachable.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use conduit_core::address::Address;
use conduit_core::config::ContextConfig;
use conduit_core::error::RuntimeError;
use conduit_core::message::Message;
use conduit_transport::{SocketManager, TransportError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::handler::MessageHandler;

pub struct MessageRouter {
    local_context: String,
    handlers: Mutex<HashMap<Address, Arc<dyn MessageHandler>>>,
    pending_by_peer: Mutex<HashMap<String, HashSet<Address>>>,
    transport: OnceLock<SocketManager>,
}

impl MessageRouter {
    /// Binds the transport and wires its inbound/peer-lost callbacks back
    /// into the returned router. Two-phase: the router is allocated first so
    /// its address is stable for the callbacks, then the socket manager
    /// (which needs those callbacks up front) is started and slotted in.
    pub fn start(config: ContextConfig) -> Result<Arc<Self>, TransportError> {
        let router = Arc::new(MessageRouter {
            local_context: config.context_name.clone(),
            handlers: Mutex::new(HashMap::new()),
            pending_by_peer: Mutex::new(HashMap::new()),
            transport: OnceLock::new(),
        });

        let inbound_router = router.clone();
        let on_inbound = Arc::new(move |message: Message| inbound_router.dispatch_inbound(message));
        let lost_router = router.clone();
        let on_peer_lost = Arc::new(move |peer: &str| lost_router.handle_peer_lost(peer));

        let transport = SocketManager::start(config, router.local_context.clone(), on_inbound, on_peer_lost)?;
        router
            .transport
            .set(transport)
            .unwrap_or_else(|_| unreachable!("transport is only ever set once, immediately after construction"));
        Ok(router)
    }

    fn transport(&self) -> &SocketManager {
        self.transport.get().expect("MessageRouter::start always initialises the transport before returning")
    }

    pub fn local_context(&self) -> &str {
        &self.local_context
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.transport().local_tcp_addr()
    }

    pub fn register_handler(&self, address: Address, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().insert(address, handler);
    }

    pub fn unregister_handler(&self, address: &Address) {
        self.handlers.lock().remove(address);
    }

    /// Marks `address` as awaiting a reply routed through `peer_context`, so
    /// that if the peer connection dies first the handler hears about it via
    /// [`MessageHandler::on_peer_lost`] instead of waiting forever.
    pub fn track_pending(&self, address: Address, peer_context: &str) {
        self.pending_by_peer
            .lock()
            .entry(peer_context.to_owned())
            .or_default()
            .insert(address);
    }

    pub fn untrack_pending(&self, address: &Address, peer_context: &str) {
        if let Some(set) = self.pending_by_peer.lock().get_mut(peer_context) {
            set.remove(address);
        }
    }

    /// Delivers `message`, dispatching locally or forwarding to the peer
    /// connection for its destination's context (§4.2).
    pub fn send(&self, message: Message) -> Result<(), RuntimeError> {
        let destination = message.destination().clone();
        if destination.context() == self.local_context {
            return self.dispatch_local(message, &destination);
        }

        match self.transport().send_to_peer(destination.context(), message.clone()) {
            Ok(()) => Ok(()),
            Err(TransportError::PeerGone) => {
                self.transport()
                    .connect_peer(destination.context(), None)
                    .map_err(|err| RuntimeError::UnknownPeer { context: format!("{}: {err}", destination.context()) })?;
                self.transport()
                    .send_to_peer(destination.context(), message)
                    .map_err(|err| RuntimeError::UnknownPeer { context: format!("{}: {err}", destination.context()) })
            }
            Err(err) => Err(RuntimeError::UnknownPeer { context: format!("{}: {err}", destination.context()) }),
        }
    }

    fn dispatch_local(&self, message: Message, destination: &Address) -> Result<(), RuntimeError> {
        let handler = self.handlers.lock().get(destination).cloned();
        match handler {
            Some(handler) => {
                handler.handle(message);
                Ok(())
            }
            None => self.reply_unknown_receiver(message, destination),
        }
    }

    /// A `Request` or `Signal` to an address nobody has registered gets an
    /// automatic `UnknownReceiver` error reply so the caller doesn't hang; a
    /// reply *about* a missing address is just logged and dropped — answering
    /// it would recurse forever if the original caller has also vanished.
    fn reply_unknown_receiver(&self, message: Message, destination: &Address) -> Result<(), RuntimeError> {
        match message {
            Message::Request { source, request_id, .. } => {
                let reply = Message::error_reply(
                    destination.clone(),
                    source,
                    request_id,
                    "UnknownReceiver",
                    format!("no handler registered for `{destination}`"),
                );
                self.send(reply)
            }
            Message::Signal { .. } => {
                debug!(%destination, "dropping signal for an address with no subscriber handler");
                Ok(())
            }
            _ => {
                warn!(%destination, "dropping reply/error-reply/handshake addressed to an unknown local handler");
                Ok(())
            }
        }
    }

    fn dispatch_inbound(&self, message: Message) {
        let destination = message.destination().clone();
        if destination.context() != self.local_context {
            warn!(%destination, "dropping inbound message addressed to a foreign context");
            return;
        }
        if let Err(err) = self.dispatch_local(message, &destination) {
            warn!(%destination, error = %err, "failed to dispatch inbound message");
        }
    }

    fn handle_peer_lost(&self, peer_context: &str) {
        let addresses = self.pending_by_peer.lock().remove(peer_context).unwrap_or_default();
        for address in addresses {
            if let Some(handler) = self.handlers.lock().get(&address).cloned() {
                handler.on_peer_lost(peer_context);
            }
        }
    }

    pub fn discover(&self, window: Duration) -> Vec<(String, SocketAddr)> {
        self.transport().discover(window).into_iter().map(|(name, addr, _version)| (name, addr)).collect()
    }

    pub fn connect_peer(&self, context: &str, endpoint: Option<SocketAddr>) -> Result<(), RuntimeError> {
        self.transport()
            .connect_peer(context, endpoint)
            .map_err(|err| RuntimeError::UnknownPeer { context: format!("{context}: {err}") })
    }

    pub fn disconnect_peer(&self, context: &str) {
        self.transport().disconnect_peer(context);
    }

    pub fn known_peers(&self) -> Vec<(String, SocketAddr)> {
        self.transport().known_peers()
    }
}

//! Proxies and pending-call futures (§4.5): the caller's side of an RPC,
//! whether the callee turns out to be local or on another peer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::address::Address;
use conduit_core::error::RuntimeError;
use conduit_core::message::{new_request_id, Message, ReplyOutcome};
use conduit_core::value::Value;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::handler::MessageHandler;
use crate::router::MessageRouter;

enum FutureState {
    Pending,
    Completed(Value),
    Failed(RuntimeError),
    Cancelled,
}

/// The single-use completion slot a [`Proxy`] call registers on the router
/// and waits on. Any reply or peer-loss notification that arrives after the
/// future has already settled is discarded (logged at debug), matching the
/// "late reply after timeout" resolution in the design notes.
pub struct PendingCallFuture {
    state: Mutex<FutureState>,
    settled: Condvar,
}

impl PendingCallFuture {
    fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(FutureState::Pending), settled: Condvar::new() })
    }

    fn settle(&self, new_state: FutureState) {
        let mut state = self.state.lock();
        if matches!(*state, FutureState::Pending) {
            *state = new_state;
            self.settled.notify_all();
        } else {
            debug!("discarding a reply that arrived after the pending call had already settled");
        }
    }

    /// Blocks until the call completes, `timeout` elapses, or the call is
    /// cancelled. `None` waits indefinitely, matching a direct local call.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Value, RuntimeError> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                FutureState::Pending => {}
                FutureState::Completed(value) => return Ok(value.clone()),
                FutureState::Failed(err) => return Err(err.clone()),
                FutureState::Cancelled => return Err(RuntimeError::illegal_state("call was cancelled")),
            }
            match timeout {
                Some(duration) => {
                    let result = self.settled.wait_for(&mut state, duration);
                    if result.timed_out() && matches!(*state, FutureState::Pending) {
                        *state = FutureState::Failed(RuntimeError::Timeout);
                        return Err(RuntimeError::Timeout);
                    }
                }
                None => self.settled.wait(&mut state),
            }
        }
    }

    pub fn poll(&self) -> Option<Result<Value, RuntimeError>> {
        match &*self.state.lock() {
            FutureState::Pending => None,
            FutureState::Completed(value) => Some(Ok(value.clone())),
            FutureState::Failed(err) => Some(Err(err.clone())),
            FutureState::Cancelled => Some(Err(RuntimeError::illegal_state("call was cancelled"))),
        }
    }

    pub fn cancel(&self) {
        self.settle(FutureState::Cancelled);
    }
}

impl MessageHandler for PendingCallFuture {
    fn handle(&self, message: Message) {
        match message {
            Message::Reply { outcome: ReplyOutcome::Value(value), .. } => self.settle(FutureState::Completed(value)),
            Message::Reply { outcome: ReplyOutcome::Exception(exc), .. } => {
                self.settle(FutureState::Failed(RuntimeError::from_remote_exception(exc)))
            }
            Message::ErrorReply { kind, message, .. } => {
                self.settle(FutureState::Failed(RuntimeError::from_remote_exception(conduit_core::error::RemoteException {
                    kind,
                    message,
                    descriptor: None,
                })))
            }
            other => debug!(?other, "pending call future received an unexpected message kind"),
        }
    }

    fn on_peer_lost(&self, _peer_context: &str) {
        self.settle(FutureState::Failed(RuntimeError::PeerLost));
    }
}

/// A client-side handle bound to one destination [`Address`], used to make
/// any number of calls against it (§4.5). Cheap to clone; every call
/// allocates its own ephemeral reply address and future.
#[derive(Clone)]
pub struct Proxy {
    router: Arc<MessageRouter>,
    local_context: String,
    destination: Address,
    session_token: Arc<Mutex<Option<String>>>,
}

impl Proxy {
    pub fn new(router: Arc<MessageRouter>, destination: Address) -> Self {
        let local_context = router.local_context().to_owned();
        Self { router, local_context, destination, session_token: Arc::new(Mutex::new(None)) }
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Issues the call and returns immediately with a future the caller
    /// decides how (and whether) to wait on — the non-blocking form (§4.5).
    pub fn call_async(&self, method: impl Into<String>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Arc<PendingCallFuture>, RuntimeError> {
        let request_id = new_request_id();
        let future = PendingCallFuture::new();
        let future_address = Address::new(&self.local_context, format!("__pending_{request_id:016x}__"))
            .map_err(|err| RuntimeError::InvalidArgument { message: err.to_string() })?;

        self.router.register_handler(future_address.clone(), future.clone());
        let is_remote = self.destination.context() != self.local_context;
        if is_remote {
            self.router.track_pending(future_address.clone(), self.destination.context());
        }

        let message = Message::Request {
            source: future_address.clone(),
            destination: self.destination.clone(),
            request_id,
            method: method.into(),
            args,
            kwargs,
            lock_token: self.session_token.lock().clone(),
        };

        if let Err(err) = self.router.send(message) {
            self.router.unregister_handler(&future_address);
            if is_remote {
                self.router.untrack_pending(&future_address, self.destination.context());
            }
            return Err(err);
        }

        Ok(future)
    }

    /// Blocks until the call completes or `timeout` elapses; `None` blocks
    /// forever, which is the default a plain local call effectively gets.
    pub fn call_with_timeout(&self, method: impl Into<String>, args: Vec<Value>, kwargs: BTreeMap<String, Value>, timeout: Option<Duration>) -> Result<Value, RuntimeError> {
        let future = self.call_async(method, args, kwargs)?;
        future.wait(timeout)
    }

    pub fn call(&self, method: impl Into<String>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value, RuntimeError> {
        self.call_with_timeout(method, args, kwargs, None)
    }

    /// Acquires the service's lock and returns whether it succeeded, per the
    /// plain boolean contract `lock(token?)` answers with (§4.4). The token
    /// itself never crosses back over the reply — this proxy mints its own
    /// session token up front and supplies it explicitly, so there is
    /// nothing for the caller to learn from the reply beyond success/failure.
    pub fn lock(&self) -> Result<bool, RuntimeError> {
        let token = format!("$proxy_lock_{:016x}", rand::random::<u64>());
        let acquired = matches!(self.call("lock", vec![Value::Str(token.clone())], BTreeMap::new())?, Value::Bool(true));
        if acquired {
            *self.session_token.lock() = Some(token);
        }
        Ok(acquired)
    }

    /// Releases the lock held by this proxy's session, returning whether the
    /// held token actually matched (§4.4).
    pub fn unlock(&self) -> Result<bool, RuntimeError> {
        let released = matches!(self.call("unlock", vec![], BTreeMap::new())?, Value::Bool(true));
        if released {
            *self.session_token.lock() = None;
        }
        Ok(released)
    }

    pub fn is_locked(&self) -> Result<bool, RuntimeError> {
        Ok(matches!(self.call("is_locked", vec![], BTreeMap::new())?, Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_reply_after_cancellation_is_discarded_not_applied() {
        let future = PendingCallFuture::new();
        future.cancel();
        let src = Address::new("ctx-a", "svc").unwrap();
        let dst = Address::new("ctx-b", "__pending_1__").unwrap();
        future.handle(Message::Reply { source: src, destination: dst, request_id: 1, outcome: ReplyOutcome::Value(Value::Int(42)) });
        assert!(matches!(future.poll(), Some(Err(RuntimeError::IllegalState { .. }))));
    }

    #[test]
    fn peer_loss_fails_a_still_pending_future() {
        let future = PendingCallFuture::new();
        future.on_peer_lost("ctx-b");
        assert!(matches!(future.poll(), Some(Err(RuntimeError::PeerLost))));
    }

    #[test]
    fn successful_reply_resolves_the_future_exactly_once() {
        let future = PendingCallFuture::new();
        let src = Address::new("ctx-a", "svc").unwrap();
        let dst = Address::new("ctx-b", "__pending_1__").unwrap();
        future.handle(Message::Reply { source: src.clone(), destination: dst.clone(), request_id: 1, outcome: ReplyOutcome::Value(Value::Int(7)) });
        assert_eq!(future.wait(None).unwrap(), Value::Int(7));
        // A second reply must not overwrite the first outcome.
        future.handle(Message::Reply { source: src, destination: dst, request_id: 1, outcome: ReplyOutcome::Value(Value::Int(99)) });
        assert_eq!(future.wait(None).unwrap(), Value::Int(7));
    }
}

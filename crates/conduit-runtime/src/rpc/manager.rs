//! The RPC object manager and its worker (§4.4, §4.5): the thing that turns
//! a registered [`RpcService`] into something addressable on the router,
//! serialising every call onto a single OS thread so the service author
//! never has to think about concurrent invocations.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use conduit_core::address::Address;
use conduit_core::error::RuntimeError;
use conduit_core::message::{Message, ReplyOutcome};
use conduit_core::value::Value;
use conduit_core::worker::{CancellableWorker, StopToken};
use tracing::{debug, warn};

use crate::handler::MessageHandler;
use crate::router::MessageRouter;
use crate::rpc::service::{PublishHandle, RpcService};
use crate::signal::SignalManager;

/// Methods every service answers regardless of its own catalogue: lock
/// administration and introspection (§4.4). These bypass the lock check
/// itself — a locked service must still answer `unlock`/`force_unlock`.
const BUILTIN_METHODS: &[&str] = &["lock", "unlock", "force_unlock", "is_locked", "__methods__", "__signals__"];

enum LockState {
    Unlocked,
    Locked { owner_context: String, token: String },
}

/// Registers a service at an [`Address`] and drives it from one dedicated
/// worker thread. Dropping the returned handle does not stop the worker —
/// call [`RpcObjectManager::shutdown`] explicitly, mirroring
/// [`conduit_core::worker::CancellableWorker`]'s own explicit lifecycle.
pub struct RpcObjectManager {
    address: Address,
    sender: mpsc::Sender<Message>,
    worker: CancellableWorker,
}

impl RpcObjectManager {
    /// Builds the service's worker, registers it on `router`, and starts it
    /// immediately (a manager with no worker running could never answer the
    /// `UnknownReceiver` a client would otherwise wait forever for).
    pub fn register(
        address: Address,
        router: Arc<MessageRouter>,
        signal_manager: Arc<SignalManager>,
        service: Box<dyn RpcService>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let (sender, receiver) = mpsc::channel();
        let method_names = service.methods();
        let signal_names = service.signals();
        let publish = PublishHandle::new(address.clone(), signal_manager);

        let worker_address = address.clone();
        let worker_router = router.clone();
        let worker = CancellableWorker::new(format!("rpc-worker-{address}"), move |stop| {
            run_worker(stop, worker_address, worker_router, receiver, service, publish, method_names, signal_names);
        });

        let manager = Arc::new(RpcObjectManager { address: address.clone(), sender, worker });
        router.register_handler(address, manager.clone());
        manager.worker.start()?;
        Ok(manager)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Unregisters from the router, stops the worker, and answers every
    /// request still sitting in the queue with `UnknownReceiver` so callers
    /// don't hang waiting on a service that no longer exists (§4.4).
    pub fn shutdown(&self, router: &MessageRouter) -> Result<(), RuntimeError> {
        router.unregister_handler(&self.address);
        self.worker.request_stop();
        self.worker.join(Duration::from_secs(5))
    }
}

impl MessageHandler for RpcObjectManager {
    fn handle(&self, message: Message) {
        if !matches!(message, Message::Request { .. }) {
            debug!(address = %self.address, "rpc object manager ignoring a non-request message");
            return;
        }
        if self.sender.send(message).is_err() {
            warn!(address = %self.address, "rpc worker queue is closed, dropping request");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    stop: StopToken,
    address: Address,
    router: Arc<MessageRouter>,
    receiver: mpsc::Receiver<Message>,
    mut service: Box<dyn RpcService>,
    publish: PublishHandle,
    method_names: Vec<String>,
    signal_names: Vec<String>,
) {
    let mut lock_state = LockState::Unlocked;
    let mut next_default_token: u64 = 0;

    loop {
        let message = match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => {
                if stop.is_set() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Message::Request { source, request_id, method, args, kwargs, lock_token, .. } = message else {
            continue;
        };

        let reply = process_request(
            &mut service,
            &publish,
            &mut lock_state,
            &mut next_default_token,
            &source,
            &method,
            args,
            kwargs,
            lock_token,
            &method_names,
            &signal_names,
        );
        let reply_message = match reply {
            Outcome::Value(outcome) => Message::Reply { source: address.clone(), destination: source, request_id, outcome },
            Outcome::Protocol { kind, message } => Message::error_reply(address.clone(), source, request_id, kind, message),
        };
        if let Err(err) = router.send(reply_message) {
            warn!(address = %address, error = %err, "failed to deliver rpc reply");
        }
    }

    drain_with_unknown_receiver(&address, &router, &receiver);
}

fn drain_with_unknown_receiver(address: &Address, router: &MessageRouter, receiver: &mpsc::Receiver<Message>) {
    while let Ok(message) = receiver.try_recv() {
        if let Message::Request { source, request_id, .. } = message {
            let reply = Message::error_reply(address.clone(), source, request_id, "UnknownReceiver", "service removed");
            let _ = router.send(reply);
        }
    }
}

enum Outcome {
    Value(ReplyOutcome),
    Protocol { kind: &'static str, message: String },
}

#[allow(clippy::too_many_arguments)]
fn process_request(
    service: &mut Box<dyn RpcService>,
    publish: &PublishHandle,
    lock_state: &mut LockState,
    next_default_token: &mut u64,
    source: &Address,
    method: &str,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    lock_token: Option<String>,
    method_names: &[String],
    signal_names: &[String],
) -> Outcome {
    let is_builtin = BUILTIN_METHODS.contains(&method);
    if !is_builtin && !method_names.iter().any(|m| m == method) {
        return Outcome::Protocol { kind: "UnknownMethod", message: format!("no method named `{method}`") };
    }

    if let LockState::Locked { owner_context, token, .. } = lock_state {
        if !is_builtin {
            let holds_lock = source.context() == owner_context && lock_token.as_deref() == Some(token.as_str());
            if !holds_lock {
                return Outcome::Protocol { kind: "Locked", message: format!("service is locked by `{owner_context}`") };
            }
        }
    }

    match method {
        "lock" => handle_lock(lock_state, next_default_token, source, &args),
        "unlock" => handle_unlock(lock_state, source, lock_token.as_deref()),
        "force_unlock" => {
            *lock_state = LockState::Unlocked;
            Outcome::Value(ReplyOutcome::Value(Value::Bool(true)))
        }
        "is_locked" => Outcome::Value(ReplyOutcome::Value(Value::Bool(matches!(lock_state, LockState::Locked { .. })))),
        "__methods__" => {
            let mut names: Vec<Value> = method_names.iter().cloned().map(Value::Str).collect();
            names.extend(BUILTIN_METHODS.iter().map(|m| Value::Str((*m).to_owned())));
            Outcome::Value(ReplyOutcome::Value(Value::List(names)))
        }
        "__signals__" => Outcome::Value(ReplyOutcome::Value(Value::List(signal_names.iter().cloned().map(Value::Str).collect()))),
        _ => match service.call(method, args, kwargs, publish) {
            Ok(value) => Outcome::Value(ReplyOutcome::Value(value)),
            Err(err) => Outcome::Value(ReplyOutcome::Exception(err.to_remote_exception())),
        },
    }
}

/// Atomically locks the service if currently unlocked and returns `true`;
/// returns `false` without taking the lock otherwise — `lock` never fails,
/// it just reports whether it succeeded (§4.4).
fn handle_lock(lock_state: &mut LockState, next_default_token: &mut u64, source: &Address, args: &[Value]) -> Outcome {
    if matches!(lock_state, LockState::Locked { .. }) {
        return Outcome::Value(ReplyOutcome::Value(Value::Bool(false)));
    }

    let token = match args.first().and_then(Value::as_str) {
        Some(requested) if !requested.is_empty() => requested.to_owned(),
        _ => {
            *next_default_token += 1;
            format!("$lock_{next_default_token}")
        }
    };
    *lock_state = LockState::Locked { owner_context: source.context().to_owned(), token };
    Outcome::Value(ReplyOutcome::Value(Value::Bool(true)))
}

/// Succeeds iff the held token matches, returning `true`/`false`; a mismatch
/// is logged as a warning rather than surfaced as a protocol error (§4.4).
fn handle_unlock(lock_state: &mut LockState, source: &Address, lock_token: Option<&str>) -> Outcome {
    match lock_state {
        LockState::Locked { owner_context, token }
            if owner_context == source.context() && lock_token == Some(token.as_str()) =>
        {
            *lock_state = LockState::Unlocked;
            Outcome::Value(ReplyOutcome::Value(Value::Bool(true)))
        }
        LockState::Unlocked => Outcome::Value(ReplyOutcome::Value(Value::Bool(true))),
        LockState::Locked { owner_context, .. } => {
            warn!(%owner_context, caller = %source, "unlock rejected: token mismatch");
            Outcome::Value(ReplyOutcome::Value(Value::Bool(false)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_round_trips_to_unlocked() {
        let mut state = LockState::Unlocked;
        let mut counter = 0u64;
        let owner = Address::new("ctx-a", "client").unwrap();

        let locked = handle_lock(&mut state, &mut counter, &owner, &[]);
        assert!(matches!(locked, Outcome::Value(ReplyOutcome::Value(Value::Bool(true)))));
        let token = match &state {
            LockState::Locked { token, .. } => token.clone(),
            LockState::Unlocked => panic!("expected the service to be locked"),
        };

        let unlocked = handle_unlock(&mut state, &owner, Some(&token));
        assert!(matches!(unlocked, Outcome::Value(ReplyOutcome::Value(Value::Bool(true)))));
        assert!(matches!(state, LockState::Unlocked));
    }

    #[test]
    fn a_second_context_cannot_lock_an_already_locked_service() {
        let mut state = LockState::Unlocked;
        let mut counter = 0u64;
        let first = Address::new("ctx-a", "client").unwrap();
        let second = Address::new("ctx-b", "client").unwrap();

        handle_lock(&mut state, &mut counter, &first, &[]);
        let attempt = handle_lock(&mut state, &mut counter, &second, &[]);
        assert!(matches!(attempt, Outcome::Value(ReplyOutcome::Value(Value::Bool(false)))));
    }

    #[test]
    fn unlock_with_the_wrong_token_is_rejected() {
        let mut state = LockState::Unlocked;
        let mut counter = 0u64;
        let owner = Address::new("ctx-a", "client").unwrap();
        handle_lock(&mut state, &mut counter, &owner, &[]);

        let attempt = handle_unlock(&mut state, &owner, Some("not-the-token"));
        assert!(matches!(attempt, Outcome::Value(ReplyOutcome::Value(Value::Bool(false)))));
    }

    #[test]
    fn unknown_method_is_rejected_before_the_lock_check() {
        let mut state = LockState::Unlocked;
        let mut counter = 0u64;
        let caller = Address::new("ctx-a", "client").unwrap();
        let outcome = process_request(
            &mut (Box::new(crate::rpc::service::ClosureService::new()) as Box<dyn RpcService>),
            &PublishHandle::new(
                Address::new("ctx-a", "svc").unwrap(),
                SignalManager::new("ctx-a".into(), test_router()),
            ),
            &mut state,
            &mut counter,
            &caller,
            "does_not_exist",
            vec![],
            BTreeMap::new(),
            None,
            &[],
            &[],
        );
        assert!(matches!(outcome, Outcome::Protocol { kind: "UnknownMethod", .. }));
    }

    fn test_router() -> Arc<MessageRouter> {
        let mut config = conduit_core::config::ContextConfig::new("ctx-a", "test-lab").with_bind_port(0);
        config.discovery_port = 0;
        MessageRouter::start(config).expect("router starts on ephemeral ports")
    }
}

//! The signal manager and receiver (§4.6): one-to-many publish/subscribe,
//! addressed uniformly whether the subscriber is local or on another peer.
//!
//! The manager lives at [`conduit_core::address::SIGNAL_MANAGER_OBJECT`] in
//! every context and answers `subscribe`/`unsubscribe`/`publish` as ordinary
//! RPC methods so a remote context can drive it exactly the way a local
//! service would; a service publishing its own signal skips that indirection
//! and calls [`SignalManager::publish`] directly, since it is already running
//! in the same process and going through the router would only hand the
//! request straight back to this same object.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use conduit_core::address::Address;
use conduit_core::error::RuntimeError;
use conduit_core::message::{Message, ReplyOutcome};
use conduit_core::value::Value;
use conduit_core::worker::CancellableWorker;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::handler::MessageHandler;
use crate::router::MessageRouter;

/// Per-subscriber outbound queues deeper than this drop their oldest entry
/// rather than grow without bound (§4.6 backpressure).
const QUEUE_HIGH_WATER_MARK: usize = 256;

const FORWARDER_TICK: Duration = Duration::from_millis(5);

#[derive(Clone, PartialEq, Eq, Hash)]
struct SignalKey {
    service: Address,
    signal: String,
}

struct Subscriber {
    address: Address,
    queue: VecDeque<Value>,
}

/// Owns the subscription table and a single forwarder thread that drains
/// every subscriber's queue and hands each payload to the router.
pub struct SignalManager {
    local_context: String,
    router: Arc<MessageRouter>,
    subscriptions: Mutex<HashMap<SignalKey, Vec<Subscriber>>>,
    forwarder: OnceLock<CancellableWorker>,
}

impl SignalManager {
    pub fn new(local_context: String, router: Arc<MessageRouter>) -> Arc<Self> {
        let manager = Arc::new(SignalManager {
            local_context,
            router,
            subscriptions: Mutex::new(HashMap::new()),
            forwarder: OnceLock::new(),
        });
        let weak = Arc::downgrade(&manager);
        let forwarder = CancellableWorker::new("signal-forwarder", move |stop| {
            while !stop.is_set() {
                match weak.upgrade() {
                    Some(manager) => manager.drain_tick(),
                    None => break,
                }
                stop.sleep(FORWARDER_TICK);
            }
        });
        manager
            .forwarder
            .set(forwarder)
            .unwrap_or_else(|_| unreachable!("forwarder is only ever set once, immediately after construction"));
        manager
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        self.forwarder().start()
    }

    pub fn stop(&self) {
        self.forwarder().request_stop();
        let _ = self.forwarder().join(Duration::from_secs(2));
    }

    fn forwarder(&self) -> &CancellableWorker {
        self.forwarder.get().expect("SignalManager::new always initialises the forwarder")
    }

    pub fn address(&self) -> Address {
        Address::signal_manager(&self.local_context).expect("context name already validated")
    }

    pub fn subscribe(&self, service: Address, signal: String, subscriber: Address) {
        let key = SignalKey { service, signal };
        let mut subscriptions = self.subscriptions.lock();
        let list = subscriptions.entry(key).or_default();
        if !list.iter().any(|s| s.address == subscriber) {
            list.push(Subscriber { address: subscriber, queue: VecDeque::new() });
        }
    }

    pub fn unsubscribe(&self, service: &Address, signal: &str, subscriber: &Address) {
        let key = SignalKey { service: service.clone(), signal: signal.to_owned() };
        if let Some(list) = self.subscriptions.lock().get_mut(&key) {
            list.retain(|s| &s.address != subscriber);
        }
    }

    /// Queues `payload` for every current subscriber of `(service, signal)`.
    /// Never blocks: a subscriber whose queue is already at the high-water
    /// mark silently loses its oldest unread signal instead (§4.6).
    pub fn publish(&self, service: Address, signal: String, payload: Value) {
        let key = SignalKey { service, signal };
        let mut subs = self.subscriptions.lock();
        if let Some(list) = subs.get_mut(&key) {
            for sub in list.iter_mut() {
                if sub.queue.len() >= QUEUE_HIGH_WATER_MARK {
                    sub.queue.pop_front();
                    warn!(subscriber = %sub.address, signal = %key.signal, "signal queue high-water mark exceeded, dropping oldest");
                }
                sub.queue.push_back(payload.clone());
            }
        }
    }

    fn drain_tick(&self) {
        let mut batch = Vec::new();
        {
            let mut subs = self.subscriptions.lock();
            for (key, list) in subs.iter_mut() {
                for sub in list.iter_mut() {
                    while let Some(payload) = sub.queue.pop_front() {
                        batch.push((key.service.clone(), sub.address.clone(), key.signal.clone(), payload));
                    }
                }
            }
        }
        for (service, subscriber, signal, payload) in batch {
            let message = Message::signal_now(service, subscriber, signal, payload);
            if let Err(err) = self.router.send(message) {
                warn!(error = %err, "failed to deliver signal");
            }
        }
    }

    fn dispatch_rpc(&self, method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        match method {
            "subscribe" => {
                let (service, signal, subscriber) = parse_subscription_args(args)?;
                self.subscribe(service, signal, subscriber);
                Ok(Value::Bool(true))
            }
            "unsubscribe" => {
                let (service, signal, subscriber) = parse_subscription_args(args)?;
                self.unsubscribe(&service, &signal, &subscriber);
                Ok(Value::Bool(true))
            }
            "publish" => Err(RuntimeError::InvalidArgument {
                message: "publish must be called by the owning service directly, not over RPC".into(),
            }),
            other => Err(RuntimeError::UnknownMethod { service: "__signals__".into(), method: other.to_owned() }),
        }
    }
}

fn parse_subscription_args(args: &[Value]) -> Result<(Address, String, Address), RuntimeError> {
    let bad = || RuntimeError::InvalidArgument { message: "expected (service_address, signal, subscriber_address)".into() };
    let service = args.first().and_then(Value::as_str).ok_or_else(bad)?;
    let signal = args.get(1).and_then(Value::as_str).ok_or_else(bad)?;
    let subscriber = args.get(2).and_then(Value::as_str).ok_or_else(bad)?;
    let service = Address::parse(service).map_err(|e| RuntimeError::InvalidArgument { message: e.to_string() })?;
    let subscriber = Address::parse(subscriber).map_err(|e| RuntimeError::InvalidArgument { message: e.to_string() })?;
    Ok((service, signal.to_owned(), subscriber))
}

impl MessageHandler for SignalManager {
    fn handle(&self, message: Message) {
        let Message::Request { source, destination, request_id, method, args, .. } = message else {
            return;
        };
        let outcome = self.dispatch_rpc(&method, &args);
        let reply = match outcome {
            Ok(value) => Message::Reply { source: destination, destination: source, request_id, outcome: ReplyOutcome::Value(value) },
            Err(err) => Message::Reply {
                source: destination,
                destination: source,
                request_id,
                outcome: ReplyOutcome::Exception(err.to_remote_exception()),
            },
        };
        if let Err(err) = self.router.send(reply) {
            warn!(error = %err, "failed to send signal-manager reply");
        }
    }
}

/// A bounded local inbox for one subscriber: [`SignalManager`] addresses it
/// just like any other handler and it turns inbound [`Message::Signal`]
/// frames into plain [`Value`] payloads a caller can poll or subscribe a
/// callback to (§4.6 receiver side).
pub struct SignalReceiver {
    queue: Mutex<VecDeque<Value>>,
    available: Condvar,
    callback: Mutex<Option<Box<dyn Fn(Value) + Send>>>,
    capacity: usize,
}

impl SignalReceiver {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            callback: Mutex::new(None),
            capacity,
        }
    }

    /// Installs a callback invoked inline on the router's dispatch thread for
    /// every signal received from then on, bypassing the polling queue.
    pub fn set_callback(&self, callback: impl Fn(Value) + Send + 'static) {
        *self.callback.lock() = Some(Box::new(callback));
    }

    pub fn try_pop(&self) -> Option<Value> {
        self.queue.lock().pop_front()
    }

    pub fn pop(&self) -> Value {
        let mut queue = self.queue.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                return value;
            }
            self.available.wait(&mut queue);
        }
    }

    pub fn pop_with_timeout(&self, timeout: Duration) -> Option<Value> {
        let mut queue = self.queue.lock();
        if let Some(value) = queue.pop_front() {
            return Some(value);
        }
        let result = self.available.wait_for(&mut queue, timeout);
        if result.timed_out() {
            return None;
        }
        queue.pop_front()
    }
}

impl MessageHandler for SignalReceiver {
    fn handle(&self, message: Message) {
        let Message::Signal { payload, .. } = message else { return };
        if let Some(callback) = &*self.callback.lock() {
            callback(payload);
            return;
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(payload);
        drop(queue);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_queue_drops_oldest_past_the_high_water_mark() {
        let mut sub = Subscriber { address: Address::new("a", "sink").unwrap(), queue: VecDeque::new() };
        for i in 0..(QUEUE_HIGH_WATER_MARK + 10) {
            if sub.queue.len() >= QUEUE_HIGH_WATER_MARK {
                sub.queue.pop_front();
            }
            sub.queue.push_back(Value::Int(i as i64));
        }
        assert_eq!(sub.queue.len(), QUEUE_HIGH_WATER_MARK);
        assert_eq!(sub.queue.front(), Some(&Value::Int(10)));
    }

    #[test]
    fn receiver_delivers_in_fifo_order_and_caps_capacity() {
        let receiver = SignalReceiver::new(2);
        let src = Address::new("a", "svc").unwrap();
        let dst = Address::new("b", "rx").unwrap();
        for i in 0..3 {
            receiver.handle(Message::signal_now(src.clone(), dst.clone(), "tick", Value::Int(i)));
        }
        assert_eq!(receiver.try_pop(), Some(Value::Int(1)));
        assert_eq!(receiver.try_pop(), Some(Value::Int(2)));
        assert_eq!(receiver.try_pop(), None);
    }

    #[test]
    fn callback_mode_bypasses_the_queue() {
        let receiver = SignalReceiver::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        receiver.set_callback(move |v| seen_in.lock().push(v));
        let src = Address::new("a", "svc").unwrap();
        let dst = Address::new("b", "rx").unwrap();
        receiver.handle(Message::signal_now(src, dst, "tick", Value::Int(7)));
        assert_eq!(*seen.lock(), vec![Value::Int(7)]);
        assert_eq!(receiver.try_pop(), None);
    }
}

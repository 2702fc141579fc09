//! The trait a registered RPC object implements, and a closure-based builder
//! for the common case of wiring up a handful of methods without a bespoke
//! type (§4.4, §4.5).

use std::collections::{BTreeMap, HashMap};

use conduit_core::address::Address;
use conduit_core::error::RuntimeError;
use conduit_core::value::Value;

use crate::signal::SignalManager;
use std::sync::Arc;

/// Lets a service publish its own signals without holding a router handle
/// or knowing its own address a second time.
#[derive(Clone)]
pub struct PublishHandle {
    service_address: Address,
    signal_manager: Arc<SignalManager>,
}

impl PublishHandle {
    pub(crate) fn new(service_address: Address, signal_manager: Arc<SignalManager>) -> Self {
        Self { service_address, signal_manager }
    }

    pub fn publish(&self, signal: &str, payload: Value) {
        self.signal_manager.publish(self.service_address.clone(), signal.to_owned(), payload);
    }
}

/// A service registered with an [`RpcObjectManager`](crate::rpc::manager::RpcObjectManager).
///
/// `call` runs exclusively on the manager's own worker thread (§5), so a
/// `&mut self` receiver is enough for interior state — no locking required
/// inside the implementation itself.
pub trait RpcService: Send {
    fn call(&mut self, method: &str, args: Vec<Value>, kwargs: BTreeMap<String, Value>, publish: &PublishHandle) -> Result<Value, RuntimeError>;

    /// The method catalogue exposed to `__methods__` introspection and
    /// consulted by the manager before a call ever reaches [`RpcService::call`].
    fn methods(&self) -> Vec<String>;

    /// The signals this service may publish; informational only; a
    /// subscriber may still subscribe to an undeclared name, and nothing
    /// here blocks [`PublishHandle::publish`].
    fn signals(&self) -> Vec<String> {
        Vec::new()
    }
}

type MethodFn = Box<dyn FnMut(Vec<Value>, BTreeMap<String, Value>, &PublishHandle) -> Result<Value, RuntimeError> + Send>;

/// A declarative alternative to implementing [`RpcService`] by hand: chain
/// [`ClosureService::method`] calls to build up a catalogue from plain
/// closures, the way a short-lived demo service or a test double usually
/// wants to.
#[derive(Default)]
pub struct ClosureService {
    methods: HashMap<String, MethodFn>,
    signals: Vec<String>,
}

impl ClosureService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(Vec<Value>, BTreeMap<String, Value>, &PublishHandle) -> Result<Value, RuntimeError> + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    pub fn signal(mut self, name: impl Into<String>) -> Self {
        self.signals.push(name.into());
        self
    }
}

impl RpcService for ClosureService {
    fn call(&mut self, method: &str, args: Vec<Value>, kwargs: BTreeMap<String, Value>, publish: &PublishHandle) -> Result<Value, RuntimeError> {
        match self.methods.get_mut(method) {
            Some(f) => f(args, kwargs, publish),
            None => Err(RuntimeError::UnknownMethod { service: "closure-service".into(), method: method.to_owned() }),
        }
    }

    fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn signals(&self) -> Vec<String> {
        self.signals.clone()
    }
}

//! The context: the composition root that owns the router, the signal
//! manager, every registered service, and every spawned task, and tears
//! them all down in reverse construction order on shutdown (§4.1, §5).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::address::{Address, CONTEXT_OBJECT};
use conduit_core::config::ContextConfig;
use conduit_core::error::RuntimeError;
use conduit_core::message::{Message, ReplyOutcome};
use conduit_core::value::Value;
use conduit_transport::TransportError;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::handler::MessageHandler;
use crate::proxy::Proxy;
use crate::router::MessageRouter;
use crate::rpc::manager::RpcObjectManager;
use crate::rpc::service::{PublishHandle, RpcService};
use crate::signal::SignalManager;
use crate::task::{FreeFormTask, LoopBody, LoopTask, OverrunPolicy};

/// Something the context stops and joins on shutdown, in the reverse order
/// it was spawned in (§5: "workers unwind in the reverse order they were
/// started, mirroring a destructor stack").
trait Shutdownable: Send + Sync {
    fn request_stop(&self);
    fn join(&self, timeout: Duration) -> Result<(), RuntimeError>;
}

impl Shutdownable for FreeFormTask {
    fn request_stop(&self) {
        FreeFormTask::request_stop(self)
    }
    fn join(&self, timeout: Duration) -> Result<(), RuntimeError> {
        FreeFormTask::join(self, timeout)
    }
}

impl Shutdownable for LoopTask {
    fn request_stop(&self) {
        LoopTask::request_stop(self)
    }
    fn join(&self, timeout: Duration) -> Result<(), RuntimeError> {
        LoopTask::join(self, timeout)
    }
}

/// The per-process runtime composition root (§4.1).
///
/// A `Context` is not itself reachable over RPC except for a small
/// introspection surface (`ping`, `known_peers`) registered at
/// [`CONTEXT_OBJECT`] — `discover`/`connect_peer` stay Rust-only API calls
/// because the socket manager runs its own `tokio` reactor, and a remote
/// peer's inbound dispatch already executes on one of that reactor's
/// threads; routing those operations (which themselves call back into the
/// same reactor with `block_on`) through message dispatch would risk
/// re-entering a runtime from one of its own worker threads.
pub struct Context {
    router: Arc<MessageRouter>,
    signal_manager: Arc<SignalManager>,
    services: Mutex<Vec<Arc<RpcObjectManager>>>,
    background: Mutex<Vec<Box<dyn Shutdownable>>>,
}

impl Context {
    pub fn start(config: ContextConfig) -> Result<Arc<Self>, TransportError> {
        let local_context = config.context_name.clone();
        let router = MessageRouter::start(config)?;
        let signal_manager = SignalManager::new(local_context.clone(), router.clone());
        signal_manager
            .start()
            .expect("signal manager worker is freshly constructed and has never been started");
        router.register_handler(signal_manager.address(), signal_manager.clone());

        let context = Arc::new(Context {
            router: router.clone(),
            signal_manager,
            services: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
        });
        router.register_handler(
            Address::context_only(&local_context).expect("context name already validated by ContextConfig"),
            context.clone(),
        );
        info!(context = %local_context, addr = %router.local_tcp_addr(), "context started");
        Ok(context)
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn local_context(&self) -> &str {
        self.router.local_context()
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.router.local_tcp_addr()
    }

    pub fn discover(&self, window: Duration) -> Vec<(String, SocketAddr)> {
        self.router.discover(window)
    }

    pub fn connect_peer(&self, context: &str, endpoint: Option<SocketAddr>) -> Result<(), RuntimeError> {
        self.router.connect_peer(context, endpoint)
    }

    pub fn disconnect_peer(&self, context: &str) {
        self.router.disconnect_peer(context)
    }

    pub fn known_peers(&self) -> Vec<(String, SocketAddr)> {
        self.router.known_peers()
    }

    /// Returns a [`Proxy`] bound to `destination`, local or remote (§4.5).
    pub fn proxy(&self, destination: Address) -> Proxy {
        Proxy::new(self.router.clone(), destination)
    }

    /// Registers `service` at `object_name` in this context and starts its
    /// worker thread immediately.
    pub fn register_service(&self, object_name: impl Into<String>, service: Box<dyn RpcService>) -> Result<Address, RuntimeError> {
        let address = Address::new(self.local_context(), object_name).map_err(|err| RuntimeError::InvalidArgument { message: err.to_string() })?;
        let manager = RpcObjectManager::register(address.clone(), self.router.clone(), self.signal_manager.clone(), service)?;
        self.services.lock().push(manager);
        Ok(address)
    }

    /// A [`PublishHandle`] for a service address already registered in this
    /// context, for code that wants to publish signals outside of an
    /// [`RpcService::call`] invocation (e.g. from a [`LoopTask`]).
    pub fn publish_handle(&self, service_address: Address) -> PublishHandle {
        PublishHandle::new(service_address, self.signal_manager.clone())
    }

    pub fn spawn_free_form_task<F>(&self, name: impl Into<String>, run: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(conduit_core::worker::StopToken) + Send + 'static,
    {
        let task = FreeFormTask::new(name, run);
        task.start()?;
        self.background.lock().push(Box::new(task));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn spawn_loop_task(
        &self,
        name: impl Into<String>,
        period: Duration,
        overrun_policy: OverrunPolicy,
        initial_settings: Value,
        body: impl LoopBody + 'static,
        publish: Option<PublishHandle>,
    ) -> Result<(), RuntimeError> {
        let task = LoopTask::new(name, period, overrun_policy, initial_settings, body, publish);
        task.start()?;
        self.background.lock().push(Box::new(task));
        Ok(())
    }

    /// Subscribes `subscriber` to `(service, signal)` via the local signal
    /// manager, bypassing the RPC round trip a remote subscriber would need.
    pub fn subscribe(&self, service: Address, signal: impl Into<String>, subscriber: Address) {
        self.signal_manager.subscribe(service, signal.into(), subscriber);
    }

    pub fn unsubscribe(&self, service: &Address, signal: &str, subscriber: &Address) {
        self.signal_manager.unsubscribe(service, signal, subscriber);
    }

    /// Stops every spawned task, then every registered service, each in the
    /// reverse order it was started in, then tears down the transport.
    pub fn shutdown(&self) {
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for task in background.into_iter().rev() {
            task.request_stop();
            if let Err(err) = task.join(Duration::from_secs(5)) {
                warn!(error = %err, "background task failed to stop within the shutdown grace period");
            }
        }

        let services: Vec<_> = self.services.lock().drain(..).collect();
        for service in services.into_iter().rev() {
            if let Err(err) = service.shutdown(&self.router) {
                warn!(address = %service.address(), error = %err, "service failed to stop within the shutdown grace period");
            }
        }

        self.signal_manager.stop();
        info!(context = %self.local_context(), "context shut down");
    }
}

impl MessageHandler for Context {
    fn handle(&self, message: Message) {
        let Message::Request { source, destination, request_id, method, .. } = message else {
            return;
        };
        let outcome = match method.as_str() {
            "ping" => Ok(Value::Bool(true)),
            "known_peers" => Ok(Value::List(
                self.known_peers()
                    .into_iter()
                    .map(|(name, addr)| {
                        let mut fields = BTreeMap::new();
                        fields.insert("context".to_owned(), Value::Str(name));
                        fields.insert("address".to_owned(), Value::Str(addr.to_string()));
                        Value::record("peer", fields)
                    })
                    .collect(),
            )),
            other => Err(RuntimeError::UnknownMethod { service: CONTEXT_OBJECT.into(), method: other.to_owned() }),
        };
        let reply = match outcome {
            Ok(value) => Message::Reply { source: destination, destination: source, request_id, outcome: ReplyOutcome::Value(value) },
            Err(err) => Message::error_reply(destination, source, request_id, err.kind().into_owned(), err.to_string()),
        };
        if let Err(err) = self.router.send(reply) {
            warn!(error = %err, "failed to send context reply");
        }
    }
}

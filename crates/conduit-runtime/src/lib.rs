//! `conduit-runtime`: the context, message router, RPC object manager and
//! worker, proxies, signal manager, and cooperative tasks built on top of
//! `conduit-core`'s primitives and `conduit-transport`'s sockets.

pub mod context;
pub mod handler;
pub mod proxy;
pub mod router;
pub mod rpc;
pub mod signal;
pub mod task;

pub use context::Context;
pub use handler::MessageHandler;
pub use proxy::{PendingCallFuture, Proxy};
pub use router::MessageRouter;
pub use rpc::{ClosureService, PublishHandle, RpcObjectManager, RpcService};
pub use signal::{SignalManager, SignalReceiver};
pub use task::{FreeFormTask, LoopBody, LoopTask, OverrunPolicy, TaskStatus};

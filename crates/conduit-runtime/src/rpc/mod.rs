pub mod manager;
pub mod service;

pub use manager::RpcObjectManager;
pub use service::{ClosureService, PublishHandle, RpcService};

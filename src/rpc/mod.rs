pub mod client;
pub mod controller_service;
pub mod server;
pub mod service;
pub mod types;

pub use service::{ClupAgentRpc, ClupAgentRpcClient};

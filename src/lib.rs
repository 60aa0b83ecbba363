pub mod broker;
pub mod config;
pub mod errors;
pub mod gate;
pub mod rpc;
pub mod task;

pub use config::Config;
pub use gate::{GateDispatcher, SessionManager};
pub use rpc::{RpcServer, ServerOptions};
pub use task::TaskTracker;

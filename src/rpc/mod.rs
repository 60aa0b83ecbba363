pub mod envelope;
pub mod server;

pub use envelope::{CallInfo, ResultInfo, RpcInfo, decode_result_info, decode_rpc_info};
pub use server::{Responder, RpcServer, ServerOptions, ServerState};

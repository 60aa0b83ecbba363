//! Gateway session management.
//!
//! Connections register through [`SessionManager::connect`] and leave through
//! [`SessionManager::disconnect`]; everything in between is addressed by
//! session id, either directly or over RPC via [`GateDispatcher`].

pub mod agent;
pub mod dispatch;
pub mod manager;
pub mod session;
pub mod storage;

pub use agent::{Agent, ChannelAgent, OutboundMessage};
pub use dispatch::GateDispatcher;
pub use manager::SessionManager;
pub use session::{MergeOutcome, Session, SessionHandle, Settings, SettingsMap};
pub use storage::{MemoryStorage, Storage};

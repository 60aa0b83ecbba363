pub mod cli;
pub mod config;
pub mod service;

pub use cli::{CliConfig, LogLevel};
pub use config::Config;
pub use service::{BrokerSection, ConfigError, GateSection, ServiceConfig};

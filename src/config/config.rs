use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};

use super::{
    cli::{CliConfig, LogLevel},
    service::ServiceConfig,
};

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static ROOT_CONFIG: OnceLock<Arc<RwLock<Config>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- Config ----------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: LogLevel,
    pub service: ServiceConfig,
}

// -----------------------------------------------------------------------------
// ----- Config: Static --------------------------------------------------------

impl Config {
    /// Async because ServiceConfig::init() is async (non-blocking IO).
    pub async fn init() {
        CliConfig::init();
        let cli = CliConfig::snapshot();
        ServiceConfig::init(&cli.config_file_location).await;

        Self::load();
    }

    /// Re-read the service file; a bad file keeps the previous values.
    pub async fn reload() {
        let cli = CliConfig::snapshot();
        ServiceConfig::reload(&cli.config_file_location).await;

        Self::load();
    }

    pub fn snapshot() -> Config {
        Self::handle().read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- Config: Private -------------------------------------------------------

impl Config {
    fn load() {
        let cli = CliConfig::snapshot();

        let next = Config {
            log_level: cli.log_level,
            service: ServiceConfig::snapshot(),
        };

        if let Some(handle) = ROOT_CONFIG.get() {
            *handle.write() = next;
        } else {
            let _ = ROOT_CONFIG.set(Arc::new(RwLock::new(next)));
        }
    }

    fn handle() -> Arc<RwLock<Config>> {
        ROOT_CONFIG
            .get()
            .unwrap_or_else(|| panic!("Config not initialized; call Config::init().await first"))
            .clone()
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

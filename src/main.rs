use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use mqgate::broker::{AmqpBroker, Broker, MemoryBroker};
use mqgate::gate::{MemoryStorage, Storage};
use mqgate::{Config, GateDispatcher, RpcServer, ServerOptions, SessionManager, TaskTracker};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "mqgate";

const IDLE_POLL: Duration = Duration::from_millis(50);

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    setup().await;
    run_until_signal().await
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

async fn setup() {
    // This has to be the first thing we do, because it initializes the config
    Config::init().await;

    init_tracing();
}

fn init_tracing() {
    let config = Config::snapshot();
    let filter = EnvFilter::try_new(config.log_level.as_str())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn connect_broker(config: &Config) -> io::Result<Arc<dyn Broker>> {
    let broker = &config.service.broker;

    match broker.scheme() {
        "amqp" | "amqps" => {
            let amqp = AmqpBroker::connect(broker.uri_exposed())
                .await
                .map_err(io::Error::other)?;
            Ok(Arc::new(amqp))
        }
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no broker client for scheme '{other}'"),
        )),
    }
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run_until_signal() -> io::Result<()> {
    // Config might reload, but the fields used here are set at startup
    let config = Config::snapshot();
    let gate = &config.service.gate;

    let broker = connect_broker(&config).await?;
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(gate.storage_ttl));
    let manager = Arc::new(SessionManager::new(Some(storage)));
    let tracker = TaskTracker::global().clone();

    let server = RpcServer::new(broker, ServerOptions::from(&config.service.broker));
    let (calls_tx, calls_rx) = mpsc::channel(gate.dispatch_capacity);

    server
        .start(calls_tx, &tracker)
        .await
        .map_err(io::Error::other)?;

    let dispatcher = GateDispatcher::new(manager.clone(), tracker.clone());
    tracker.launch("gate dispatch", dispatcher.run(calls_rx));

    info!("{} serving as {}", APP_NAME, config.service.server_id);

    if let Err(e) = signal::ctrl_c().await {
        warn!("signal handler failed: {e}");
    }
    info!("{} shutting down", APP_NAME);

    // Stop intake first; the dispatcher drains once the consume loop exits.
    if let Err(e) = server.stop_consume().await {
        warn!("stop consume: {e}");
    }

    if !tracker.wait_idle(IDLE_POLL, gate.shutdown_grace).await {
        warn!(
            "{} tasks still running after {:?}; closing anyway",
            tracker.pending(),
            gate.shutdown_grace
        );
    }

    manager.on_destroy();

    server.shutdown().await.map_err(io::Error::other)?;

    info!("{} stopped", APP_NAME);
    Ok(())
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

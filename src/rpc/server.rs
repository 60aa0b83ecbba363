use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, PublishOptions, Publishing,
    QueueDeclareOptions,
};
use crate::errors::RpcError;
use crate::task::TaskTracker;

use super::envelope::{CallInfo, decode_rpc_info};

// -----------------------------------------------------------------------------
// ----- ServerOptions ---------------------------------------------------------

/// Broker topology the server consumes from.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub binding_key: String,
    pub consumer_tag: String,
}

// -----------------------------------------------------------------------------
// ----- ServerState -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Consuming,
    Cancelled,
    Closed,
}

// -----------------------------------------------------------------------------
// ----- RpcServer -------------------------------------------------------------

/// Serves RPC calls from one durable broker queue.
///
/// Deliveries are acked as soon as they arrive, decoded, and pushed onto the
/// dispatch queue as [`CallInfo`]s. Undecodable bodies are dropped. Results go
/// back through [`RpcServer::callback`] (or [`CallInfo::respond`]) to the
/// caller's `reply_to` queue.
pub struct RpcServer {
    broker: Arc<dyn Broker>,
    options: ServerOptions,
    responder: Responder,
    state: Mutex<ServerState>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

// -----------------------------------------------------------------------------
// ----- RpcServer: Static -----------------------------------------------------

impl RpcServer {
    pub fn new(broker: Arc<dyn Broker>, options: ServerOptions) -> Self {
        Self {
            responder: Responder::new(broker.clone()),
            broker,
            options,
            state: Mutex::new(ServerState::Created),
            stop: Mutex::new(None),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RpcServer: Public -----------------------------------------------------

impl RpcServer {
    /// Declare and bind the queue, then launch the consume loop on `tracker`.
    /// Decoded calls are sent to `calls`; a full channel stalls consumption.
    pub async fn start(
        &self,
        calls: mpsc::Sender<CallInfo>,
        tracker: &TaskTracker,
    ) -> Result<(), RpcError> {
        let options = &self.options;

        self.broker
            .declare_exchange(&options.exchange, options.exchange_kind)
            .await?;

        let queue_options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let queue = self
            .broker
            .declare_queue(&options.queue, queue_options)
            .await?;

        self.broker
            .bind_queue(&queue, &options.binding_key, &options.exchange)
            .await?;

        let deliveries = self
            .broker
            .consume(&queue, &options.consumer_tag, ConsumeOptions::default())
            .await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop.lock() = Some(stop_tx);

        let consumer = ConsumeLoop {
            broker: self.broker.clone(),
            consumer_tag: options.consumer_tag.clone(),
            responder: self.responder.clone(),
            calls,
        };

        tracker.launch(format!("rpc consume {queue}"), consumer.run(deliveries, stop_rx));
        self.set_state(ServerState::Consuming);

        info!(
            "consuming {queue} (exchange={} key={})",
            options.exchange, options.binding_key
        );
        Ok(())
    }

    /// Stop new deliveries; the channel stays open for replies.
    pub async fn stop_consume(&self) -> Result<(), RpcError> {
        self.broker.cancel(&self.options.consumer_tag).await?;
        self.set_state(ServerState::Cancelled);
        Ok(())
    }

    /// Signal the consume loop and release the broker channel.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        let stop = self.stop.lock().take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        self.broker.shutdown().await?;
        self.set_state(ServerState::Closed);
        Ok(())
    }

    pub async fn callback(&self, call: &CallInfo) -> Result<(), RpcError> {
        self.responder.callback(call).await
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }
}

// -----------------------------------------------------------------------------
// ----- RpcServer: Private ----------------------------------------------------

impl RpcServer {
    fn set_state(&self, next: ServerState) {
        let mut state = self.state.lock();
        debug!("rpc server {:?} -> {:?}", *state, next);
        *state = next;
    }
}

// -----------------------------------------------------------------------------
// ----- Responder -------------------------------------------------------------

/// Publishes call results. Cheap to clone; every [`CallInfo`] carries one.
#[derive(Clone)]
pub struct Responder {
    broker: Arc<dyn Broker>,
}

impl Responder {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish `call.result` straight to the caller's reply queue.
    /// Transient, no mandatory/immediate: callers time out on their own.
    pub async fn callback(&self, call: &CallInfo) -> Result<(), RpcError> {
        let reply_to = call.reply_to().ok_or(RpcError::MissingReplyTo)?;
        let message = Publishing::transient(call.result.to_bytes());

        if let Err(e) = self
            .broker
            .publish("", reply_to, PublishOptions::default(), message)
            .await
        {
            warn!("reply publish to {reply_to} failed: {e}");
            return Err(e.into());
        }

        Ok(())
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: ConsumeLoop -------------------------------------------------

struct ConsumeLoop {
    broker: Arc<dyn Broker>,
    consumer_tag: String,
    responder: Responder,
    calls: mpsc::Sender<CallInfo>,
}

impl ConsumeLoop {
    /// Runs until the stream ends, the stop signal fires, or the dispatch
    /// queue goes away. The stop signal is only seen between deliveries.
    async fn run(self, mut deliveries: DeliveryStream, mut stop: oneshot::Receiver<()>) {
        loop {
            select! {
                biased;

                _ = &mut stop => {
                    if let Err(e) = self.broker.cancel(&self.consumer_tag).await {
                        debug!("consumer {} cancel on stop: {e}", self.consumer_tag);
                    }
                    break;
                }

                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        debug!("delivery stream for {} closed", self.consumer_tag);
                        break;
                    };

                    if let Err(e) = self.handle(delivery).await {
                        error!("consumer {} stopping: {e}", self.consumer_tag);
                        break;
                    }
                }
            }
        }

        info!("consumer {} finished", self.consumer_tag);
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), RpcError> {
        let tag = delivery.delivery_tag;

        if let Err(e) = self.broker.ack(tag).await {
            warn!("ack of delivery {tag} failed: {e}");
        }

        let rpc_info = match decode_rpc_info(&delivery.body) {
            Ok(info) => info,
            Err(e) => {
                warn!("dropping delivery {tag}: {e}");
                return Ok(());
            }
        };

        let call = CallInfo::new(rpc_info, self.responder.clone());

        self.calls
            .send(call)
            .await
            .map_err(|_| RpcError::QueueClosed)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

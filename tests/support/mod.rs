use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mqgate::broker::{
    Broker, ConsumeOptions, DeliveryStream, ExchangeKind, MemoryBroker, PublishOptions,
    Publishing, QueueDeclareOptions,
};
use mqgate::gate::{ChannelAgent, MemoryStorage, OutboundMessage, Session, Storage};
use mqgate::rpc::{ResultInfo, RpcInfo, decode_result_info};
use mqgate::{GateDispatcher, RpcServer, ServerOptions, SessionManager, TaskTracker};

pub const EXCHANGE: &str = "mqgate";
pub const SERVER_ID: &str = "gate-1";
pub const REPLY_QUEUE: &str = "Q1";

// A gate wired the way the binary wires it, on an in-process broker.
pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub storage: Arc<MemoryStorage>,
    pub manager: Arc<SessionManager>,
    pub server: RpcServer,
    pub tracker: TaskTracker,
    replies: DeliveryStream,
}

impl Harness {
    pub async fn start() -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let storage = Arc::new(MemoryStorage::new(None));
        let manager = Arc::new(SessionManager::new(Some(
            storage.clone() as Arc<dyn Storage>
        )));
        let tracker = TaskTracker::new();

        let options = ServerOptions {
            exchange: EXCHANGE.into(),
            exchange_kind: ExchangeKind::Direct,
            queue: format!("gate@{SERVER_ID}"),
            binding_key: SERVER_ID.into(),
            consumer_tag: SERVER_ID.into(),
        };
        let server = RpcServer::new(broker.clone(), options);

        let (tx, rx) = mpsc::channel(16);
        server.start(tx, &tracker).await.expect("start rpc server");
        tracker.launch(
            "gate dispatch",
            GateDispatcher::new(manager.clone(), tracker.clone()).run(rx),
        );

        let reply_options = QueueDeclareOptions {
            auto_delete: true,
            exclusive: true,
            ..Default::default()
        };
        broker
            .declare_queue(REPLY_QUEUE, reply_options)
            .await
            .expect("declare reply queue");
        let replies = broker
            .consume(
                REPLY_QUEUE,
                "caller",
                ConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
            )
            .await
            .expect("consume reply queue");

        Self {
            broker,
            storage,
            manager,
            server,
            tracker,
            replies,
        }
    }

    #[allow(dead_code)]
    pub fn connect(&self, session_id: &str) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let session = Session::new(session_id, "10.1.1.1", "ws", SERVER_ID).into_handle();
        let (agent, rx) = ChannelAgent::new(Some(session));
        self.manager.connect(Arc::new(agent));
        rx
    }

    pub async fn publish_raw(&self, body: Bytes) {
        self.broker
            .publish(
                EXCHANGE,
                SERVER_ID,
                PublishOptions::default(),
                Publishing::transient(body),
            )
            .await
            .expect("publish");
    }

    pub async fn call(&self, method: &str, args: &[&[u8]]) {
        let info = RpcInfo {
            cid: format!("cid-{method}"),
            method: method.into(),
            reply_to: REPLY_QUEUE.into(),
            reply: true,
            args: args.iter().map(|a| a.to_vec()).collect(),
            ..Default::default()
        };
        self.publish_raw(info.to_bytes()).await;
    }

    pub async fn next_reply(&mut self) -> ResultInfo {
        let delivery = timeout(Duration::from_secs(2), self.replies.recv())
            .await
            .expect("reply within 2s")
            .expect("reply stream open");

        decode_result_info(&delivery.body).expect("decodable reply")
    }

    /// Stop intake, drain, close sessions, release the broker.
    pub async fn shutdown(&self) -> bool {
        self.server.stop_consume().await.expect("stop consume");
        let idle = self
            .tracker
            .wait_idle(Duration::from_millis(5), Duration::from_secs(2))
            .await;
        self.manager.on_destroy();
        self.server.shutdown().await.expect("shutdown");
        idle
    }
}

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::DispatchError;
use crate::rpc::{CallInfo, ResultInfo, RpcInfo};
use crate::task::TaskTracker;

use super::manager::SessionManager;
use super::session::{Session, SettingsMap};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const RESULT_SESSION: &str = "session";
pub const RESULT_STRING: &str = "string";
pub const RESULT_BOOL: &str = "bool";

const ACK: &[u8] = b"success";

// -----------------------------------------------------------------------------
// ----- GateDispatcher --------------------------------------------------------

/// Drains the dispatch queue, serving each call on its own launched task.
pub struct GateDispatcher {
    manager: Arc<SessionManager>,
    tracker: TaskTracker,
}

impl GateDispatcher {
    pub fn new(manager: Arc<SessionManager>, tracker: TaskTracker) -> Self {
        Self { manager, tracker }
    }

    /// Returns once every sender of `calls` is gone.
    pub async fn run(self, mut calls: mpsc::Receiver<CallInfo>) {
        while let Some(call) = calls.recv().await {
            let name = format!("gate call {}", call.rpc_info.method);
            self.tracker.launch(name, serve(self.manager.clone(), call));
        }

        debug!("dispatch queue closed");
    }
}

/// Execute one call against the session manager and answer it if the caller
/// asked for a reply.
pub async fn serve(manager: Arc<SessionManager>, call: CallInfo) {
    let info = &call.rpc_info;

    if call.is_expired() {
        warn!("dropping expired call {} ({})", info.cid, info.method);
        return;
    }

    let result = match execute(&manager, info).await {
        Ok(reply) => ResultInfo::success(&info.cid, reply.result_type, reply.body),
        Err(e) => {
            debug!("call {} ({}) failed: {e}", info.cid, info.method);
            ResultInfo::failure(&info.cid, e.to_string())
        }
    };

    if !info.reply {
        return;
    }

    let cid = info.cid.clone();
    if let Err(e) = call.respond(result).await {
        warn!("reply for call {cid} not delivered: {e}");
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Execution ---------------------------------------------------

async fn execute(manager: &SessionManager, info: &RpcInfo) -> Result<Reply, DispatchError> {
    let method = Method::parse(&info.method)
        .ok_or_else(|| DispatchError::UnknownMethod(info.method.clone()))?;
    let args = Args::check(method, &info.args)?;

    let reply = match method {
        Method::Update => Reply::session(manager.update(args.text(0)?)?),

        Method::Bind => Reply::session(manager.bind(args.text(0)?, args.text(1)?).await?),

        Method::UnBind => Reply::session(manager.unbind(args.text(0)?)?),

        Method::Push => {
            let settings = SettingsMap::decode(args.bytes(1))?.settings;
            Reply::session(manager.push(args.text(0)?, settings).await?)
        }

        Method::Set => {
            let session = manager
                .set(args.text(0)?, args.text(1)?, args.text(2)?)
                .await?;
            Reply::session(session)
        }

        Method::Remove => Reply::session(manager.remove(args.text(0)?, args.text(1)?).await?),

        Method::Send => {
            let payload = Bytes::copy_from_slice(args.bytes(2));
            manager
                .send(args.text(0)?, args.text(1)?, payload)
                .await?;
            Reply::ack()
        }

        Method::Close => {
            manager.close(args.text(0)?)?;
            Reply::ack()
        }

        Method::IsConnect => Reply::flag(manager.is_connect(args.text(0)?)?),

        Method::Heartbeat => {
            manager.heartbeat(args.text(0)?).await?;
            Reply::ack()
        }
    };

    Ok(reply)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Update,
    Bind,
    UnBind,
    Push,
    Set,
    Remove,
    Send,
    Close,
    IsConnect,
    Heartbeat,
}

impl Method {
    fn parse(name: &str) -> Option<Self> {
        let method = match name {
            "Update" => Method::Update,
            "Bind" => Method::Bind,
            "UnBind" => Method::UnBind,
            "Push" => Method::Push,
            "Set" => Method::Set,
            "Remove" => Method::Remove,
            "Send" => Method::Send,
            "Close" => Method::Close,
            "IsConnect" => Method::IsConnect,
            "Heartbeat" => Method::Heartbeat,
            _ => return None,
        };
        Some(method)
    }

    fn name(self) -> &'static str {
        match self {
            Method::Update => "Update",
            Method::Bind => "Bind",
            Method::UnBind => "UnBind",
            Method::Push => "Push",
            Method::Set => "Set",
            Method::Remove => "Remove",
            Method::Send => "Send",
            Method::Close => "Close",
            Method::IsConnect => "IsConnect",
            Method::Heartbeat => "Heartbeat",
        }
    }

    fn arity(self) -> usize {
        match self {
            Method::Update | Method::UnBind | Method::Close | Method::IsConnect => 1,
            Method::Heartbeat => 1,
            Method::Bind | Method::Push | Method::Remove => 2,
            Method::Set | Method::Send => 3,
        }
    }
}

struct Args<'a> {
    method: Method,
    raw: &'a [Vec<u8>],
}

impl<'a> Args<'a> {
    fn check(method: Method, raw: &'a [Vec<u8>]) -> Result<Self, DispatchError> {
        if raw.len() != method.arity() {
            return Err(DispatchError::Arity {
                method: method.name(),
                expected: method.arity(),
                got: raw.len(),
            });
        }
        Ok(Self { method, raw })
    }

    fn text(&self, index: usize) -> Result<&'a str, DispatchError> {
        std::str::from_utf8(&self.raw[index]).map_err(|_| DispatchError::BadArgument {
            method: self.method.name(),
            index,
        })
    }

    fn bytes(&self, index: usize) -> &'a [u8] {
        &self.raw[index]
    }
}

struct Reply {
    result_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn session(session: Session) -> Self {
        Self {
            result_type: RESULT_SESSION,
            body: session.to_bytes(),
        }
    }

    fn ack() -> Self {
        Self {
            result_type: RESULT_STRING,
            body: ACK.to_vec(),
        }
    }

    fn flag(value: bool) -> Self {
        let body = if value { b"true".to_vec() } else { b"false".to_vec() };
        Self {
            result_type: RESULT_BOOL,
            body,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::gate::{Agent, ChannelAgent, Settings};
    use crate::rpc::{Responder, decode_result_info};
    use std::time::Duration;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        manager: Arc<SessionManager>,
        agent: Arc<ChannelAgent>,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = Arc::new(MemoryBroker::new());
            let manager = Arc::new(SessionManager::new(None));

            let session = Session::new("s1", "10.1.1.1", "ws", "gate-1").into_handle();
            let (agent, _rx) = ChannelAgent::new(Some(session));
            let agent = Arc::new(agent);
            manager.connect(agent.clone());

            Self {
                broker,
                manager,
                agent,
            }
        }

        fn call(&self, method: &str, args: &[&[u8]]) -> CallInfo {
            let info = RpcInfo {
                cid: format!("cid-{method}"),
                method: method.into(),
                reply_to: "Q1".into(),
                reply: true,
                args: args.iter().map(|a| a.to_vec()).collect(),
                ..Default::default()
            };
            CallInfo::new(info, Responder::new(self.broker.clone()))
        }

        async fn serve(&self, call: CallInfo) -> Option<ResultInfo> {
            let before = self.broker.published().len();
            serve(self.manager.clone(), call).await;

            let published = self.broker.published();
            if published.len() == before {
                return None;
            }
            let last = published.last().unwrap();
            assert_eq!(last.routing_key, "Q1");
            Some(decode_result_info(&last.message.body).unwrap())
        }
    }

    #[tokio::test]
    async fn bind_answers_with_the_session() {
        let fx = Fixture::new();

        let result = fx.serve(fx.call("Bind", &[b"s1", b"u1"])).await.unwrap();

        assert_eq!(result.cid, "cid-Bind");
        assert!(result.error.is_empty());
        assert_eq!(result.result_type, RESULT_SESSION);
        let session = Session::from_bytes(&result.result).unwrap();
        assert_eq!(session.user_id, "u1");
    }

    #[tokio::test]
    async fn push_decodes_a_settings_map() {
        let fx = Fixture::new();
        let mut settings = Settings::new();
        settings.insert("room".into(), "42".into());
        let payload = SettingsMap { settings: settings.clone() }.encode_to_vec();

        let result = fx.serve(fx.call("Push", &[b"s1", &payload])).await.unwrap();

        let session = Session::from_bytes(&result.result).unwrap();
        assert_eq!(session.settings, settings);
    }

    #[tokio::test]
    async fn is_connect_answers_with_a_flag_or_error() {
        let fx = Fixture::new();

        let result = fx.serve(fx.call("IsConnect", &[b"u1"])).await.unwrap();
        assert!(result.error.contains("u1"));

        fx.manager.bind("s1", "u1").await.unwrap();
        let result = fx.serve(fx.call("IsConnect", &[b"u1"])).await.unwrap();
        assert_eq!(result.result_type, RESULT_BOOL);
        assert_eq!(result.result, b"true".to_vec());
    }

    #[tokio::test]
    async fn errors_travel_in_the_result() {
        let fx = Fixture::new();

        let result = fx.serve(fx.call("Explode", &[])).await.unwrap();
        assert_eq!(result.error, "unknown method 'Explode'");

        let result = fx.serve(fx.call("Set", &[b"s1"])).await.unwrap();
        assert_eq!(result.error, "Set expects 3 arguments, got 1");

        let result = fx.serve(fx.call("Update", &[&[0xFF, 0xFE]])).await.unwrap();
        assert_eq!(result.error, "Update argument 0 is not valid UTF-8");

        let result = fx.serve(fx.call("Update", &[b"ghost"])).await.unwrap();
        assert_eq!(result.error, "No Session found");
    }

    #[tokio::test]
    async fn no_reply_requested_means_no_publish() {
        let fx = Fixture::new();
        let mut call = fx.call("Set", &[b"s1", b"k", b"v"]);
        call.rpc_info.reply = false;

        assert!(fx.serve(call).await.is_none());
        assert_eq!(fx.manager.get("s1", "k").unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn expired_calls_are_dropped() {
        let fx = Fixture::new();
        let mut call = fx.call("Close", &[b"s1"]);
        call.rpc_info.expired = 1;

        assert!(fx.serve(call).await.is_none());
        assert!(!fx.agent.is_closed());
    }

    #[tokio::test]
    async fn run_serves_until_the_queue_closes() {
        let fx = Fixture::new();
        let tracker = TaskTracker::new();
        let (tx, rx) = mpsc::channel(4);

        tx.send(fx.call("Update", &[b"s1"])).await.unwrap();
        tx.send(fx.call("Heartbeat", &[b"s1"])).await.unwrap();
        drop(tx);

        GateDispatcher::new(fx.manager.clone(), tracker.clone())
            .run(rx)
            .await;

        assert!(
            tracker
                .wait_idle(Duration::from_millis(5), Duration::from_secs(2))
                .await
        );
        assert_eq!(fx.broker.published().len(), 2);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

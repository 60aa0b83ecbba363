use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::session::SessionHandle;

// -----------------------------------------------------------------------------
// ----- Agent -----------------------------------------------------------------

/// One live client connection, owned by the transport layer. The gate only
/// observes it between `connect` and `disconnect`.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn write_msg(&self, topic: &str, body: Bytes) -> io::Result<()>;

    /// Ask the connection to close. Deregistration follows asynchronously
    /// through `SessionManager::disconnect`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn session(&self) -> Option<SessionHandle>;

    fn recv_count(&self) -> u64;

    fn send_count(&self) -> u64;
}

// -----------------------------------------------------------------------------
// ----- ChannelAgent ----------------------------------------------------------

/// In-process agent whose outbound messages land on an mpsc channel.
#[derive(Debug)]
pub struct ChannelAgent {
    session: Option<SessionHandle>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    closed: AtomicBool,
    recv: AtomicU64,
    sent: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: Bytes,
}

impl ChannelAgent {
    pub fn new(session: Option<SessionHandle>) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();

        let agent = Self {
            session,
            outbound,
            closed: AtomicBool::new(false),
            recv: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        };

        (agent, rx)
    }

    /// Count one inbound client message.
    pub fn record_inbound(&self) {
        self.recv.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Agent for ChannelAgent {
    async fn write_msg(&self, topic: &str, body: Bytes) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        let message = OutboundMessage {
            topic: topic.to_string(),
            body,
        };

        self.outbound
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"))?;

        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session.clone()
    }

    fn recv_count(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    fn send_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Session;

    #[tokio::test]
    async fn writes_reach_the_channel_and_count() {
        let session = Session::new("s1", "127.0.0.1", "tcp", "gate-1").into_handle();
        let (agent, mut rx) = ChannelAgent::new(Some(session));

        agent.write_msg("chat/say", Bytes::from_static(b"hi")).await.unwrap();
        agent.record_inbound();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "chat/say");
        assert_eq!(msg.body, Bytes::from_static(b"hi"));
        assert_eq!(agent.send_count(), 1);
        assert_eq!(agent.recv_count(), 1);
    }

    #[tokio::test]
    async fn closed_agent_refuses_writes() {
        let (agent, _rx) = ChannelAgent::new(None);
        agent.close();

        let err = agent.write_msg("t", Bytes::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(agent.is_closed());
    }

    #[tokio::test]
    async fn dropped_peer_is_a_broken_pipe() {
        let (agent, rx) = ChannelAgent::new(None);
        drop(rx);

        let err = agent.write_msg("t", Bytes::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(agent.send_count(), 0);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

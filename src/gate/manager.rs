use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::errors::GateError;

use super::agent::Agent;
use super::session::{Session, SessionHandle, Settings};
use super::storage::Storage;

// -----------------------------------------------------------------------------
// ----- SessionManager --------------------------------------------------------

/// Live registry of connected sessions, keyed by session id.
///
/// Every settings mutation on a bound session is written through to storage
/// when one is configured. Storage failures are logged and never undo the
/// in-memory change. Mutations to one session are atomic in memory, but their
/// write-throughs are not ordered against each other: the last store to land
/// wins.
pub struct SessionManager {
    sessions: DashMap<String, Arc<dyn Agent>>,
    storage: Option<Arc<dyn Storage>>,
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Static ------------------------------------------------

impl SessionManager {
    pub fn new(storage: Option<Arc<dyn Storage>>) -> Self {
        Self {
            sessions: DashMap::new(),
            storage,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Connection Lifecycle ----------------------------------

impl SessionManager {
    /// Handshake finished; start tracking the agent.
    pub fn connect(&self, agent: Arc<dyn Agent>) {
        let Some(session) = agent.session() else {
            return;
        };

        let session_id = session.read().session_id.clone();
        debug!("session {session_id} connected");
        self.sessions.insert(session_id, agent);
    }

    /// Connection closed, by the peer or after `close`.
    pub fn disconnect(&self, agent: &dyn Agent) {
        let Some(session) = agent.session() else {
            return;
        };

        let session_id = session.read().session_id.clone();
        if self.sessions.remove(&session_id).is_some() {
            debug!("session {session_id} disconnected");
        }
    }

    /// Close every connection and forget them all. Used at shutdown.
    ///
    /// Every agent taken out of the registry is closed. Agents that connect
    /// while this runs stay registered.
    pub fn on_destroy(&self) {
        let session_ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for session_id in session_ids {
            // No shard lock is held across close; it may call back in.
            if let Some((_, agent)) = self.sessions.remove(&session_id) {
                agent.close();
                closed += 1;
            }
        }

        info!("closed {closed} live sessions");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Session Operations ------------------------------------

impl SessionManager {
    pub fn update(&self, session_id: &str) -> Result<Session, GateError> {
        let handle = self.session(session_id)?;
        let snapshot = handle.read().clone();
        Ok(snapshot)
    }

    pub fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, GateError> {
        let handle = self.session(session_id)?;
        let value = handle.read().settings.get(key).cloned();
        Ok(value)
    }

    /// Bind to `user_id` and warm the settings from storage.
    pub async fn bind(&self, session_id: &str, user_id: &str) -> Result<Session, GateError> {
        let handle = self.session(session_id)?;
        handle.write().user_id = user_id.to_string();

        let storage = self.storage.as_ref().filter(|_| !user_id.is_empty());

        if let Some(storage) = storage {
            match storage.query(user_id).await {
                Ok(Some(persisted)) => {
                    let (outcome, merged) = {
                        let mut session = handle.write();
                        let outcome = session.merge_persisted(persisted);
                        (outcome, session.settings.clone())
                    };

                    if outcome.needs_write_back() {
                        store_settings(storage.as_ref(), user_id, &merged).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("settings query for user {user_id} failed; binding without them: {e}");
                }
            }
        }

        let snapshot = handle.read().clone();
        Ok(snapshot)
    }

    /// Binding ends; persisted settings stay where they are.
    pub fn unbind(&self, session_id: &str) -> Result<Session, GateError> {
        let handle = self.session(session_id)?;

        let mut session = handle.write();
        session.user_id.clear();
        Ok(session.clone())
    }

    pub async fn push(&self, session_id: &str, settings: Settings) -> Result<Session, GateError> {
        self.mutate(session_id, |session| session.settings = settings)
            .await
    }

    pub async fn set(&self, session_id: &str, key: &str, value: &str) -> Result<Session, GateError> {
        self.mutate(session_id, |session| {
            session.settings.insert(key.to_string(), value.to_string());
        })
        .await
    }

    pub async fn remove(&self, session_id: &str, key: &str) -> Result<Session, GateError> {
        self.mutate(session_id, |session| {
            session.settings.remove(key);
        })
        .await
    }

    /// Extend expiry of the bound user's persisted settings.
    pub async fn heartbeat(&self, session_id: &str) -> Result<(), GateError> {
        let handle = self.session(session_id)?;

        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };

        let user_id = handle.read().user_id.clone();
        if !user_id.is_empty() {
            storage.heartbeat(&user_id).await;
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Connection Operations ---------------------------------

impl SessionManager {
    /// Scans every live session. Only this gateway's connections are seen.
    /// `true` if any session bound to the user is still open.
    pub fn is_connect(&self, user_id: &str) -> Result<bool, GateError> {
        if !user_id.is_empty() {
            let mut bound = false;

            for entry in self.sessions.iter() {
                let agent = entry.value();

                let matches = agent
                    .session()
                    .is_some_and(|session| session.read().user_id == user_id);

                if matches {
                    if !agent.is_closed() {
                        return Ok(true);
                    }
                    bound = true;
                }
            }

            if bound {
                return Ok(false);
            }
        }

        Err(GateError::UserNotFound {
            user_id: user_id.to_string(),
        })
    }

    pub async fn send(&self, session_id: &str, topic: &str, body: Bytes) -> Result<(), GateError> {
        let agent = self.agent(session_id)?;

        agent
            .write_msg(topic, body)
            .await
            .map_err(|source| GateError::Transport {
                session_id: session_id.to_string(),
                source,
            })
    }

    /// Signal the connection to close. The registry entry goes away when the
    /// transport reports the disconnect.
    pub fn close(&self, session_id: &str) -> Result<(), GateError> {
        let agent = self.agent(session_id)?;
        agent.close();
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- SessionManager: Private -----------------------------------------------

impl SessionManager {
    fn agent(&self, session_id: &str) -> Result<Arc<dyn Agent>, GateError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GateError::not_found(session_id))
    }

    fn session(&self, session_id: &str) -> Result<SessionHandle, GateError> {
        self.agent(session_id)?
            .session()
            .ok_or_else(|| GateError::not_found(session_id))
    }

    /// Apply `change` under the session lock, then write the resulting map
    /// through if the session is bound.
    async fn mutate<F>(&self, session_id: &str, change: F) -> Result<Session, GateError>
    where
        F: FnOnce(&mut Session),
    {
        let handle = self.session(session_id)?;

        let snapshot = {
            let mut session = handle.write();
            change(&mut session);
            session.clone()
        };

        if let Some(storage) = self.storage.as_ref() {
            if snapshot.is_bound() {
                store_settings(storage.as_ref(), &snapshot.user_id, &snapshot.settings).await;
            }
        }

        Ok(snapshot)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

async fn store_settings(storage: &dyn Storage, user_id: &str, settings: &Settings) {
    if let Err(e) = storage.store(user_id, settings).await {
        error!("gate session storage failure for user {user_id}: {e}");
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message;

// -----------------------------------------------------------------------------
// ----- Types -----------------------------------------------------------------

pub type Settings = HashMap<String, String>;

/// A session shared between its agent and the manager.
pub type SessionHandle = Arc<RwLock<Session>>;

// -----------------------------------------------------------------------------
// ----- Session ---------------------------------------------------------------

/// Server-side record of one live client connection.
#[derive(Clone, PartialEq, Message)]
pub struct Session {
    #[prost(string, tag = "1")]
    pub ip: String,

    #[prost(string, tag = "2")]
    pub network: String,

    #[prost(string, tag = "3")]
    pub session_id: String,

    #[prost(string, tag = "4")]
    pub server_id: String,

    /// Empty when unbound.
    #[prost(string, tag = "5")]
    pub user_id: String,

    #[prost(map = "string, string", tag = "6")]
    pub settings: Settings,
}

/// Wire wrapper for a bare settings map (argument of `Push`).
#[derive(Clone, PartialEq, Message)]
pub struct SettingsMap {
    #[prost(map = "string, string", tag = "1")]
    pub settings: Settings,
}

// -----------------------------------------------------------------------------
// ----- Session: Static -------------------------------------------------------

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        ip: impl Into<String>,
        network: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            network: network.into(),
            session_id: session_id.into(),
            server_id: server_id.into(),
            user_id: String::new(),
            settings: Settings::new(),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(buf)
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Public -------------------------------------------------------

impl Session {
    pub fn into_handle(self) -> SessionHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn is_bound(&self) -> bool {
        !self.user_id.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Fold persisted settings into the live ones. Live values win on
    /// conflict; an empty live map adopts `persisted` wholesale.
    pub fn merge_persisted(&mut self, persisted: Settings) -> MergeOutcome {
        if self.settings.is_empty() {
            self.settings = persisted;
            return MergeOutcome::Adopted;
        }

        let mut added = 0;
        for (key, value) in persisted {
            if !self.settings.contains_key(&key) {
                self.settings.insert(key, value);
                added += 1;
            }
        }

        MergeOutcome::Merged { added }
    }
}

// -----------------------------------------------------------------------------
// ----- MergeOutcome ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Adopted,
    Merged { added: usize },
}

impl MergeOutcome {
    /// Whether the merged map differs from what storage already holds.
    pub fn needs_write_back(self) -> bool {
        matches!(self, MergeOutcome::Merged { added } if added > 0)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_session_adopts_persisted() {
        let mut session = Session::new("s1", "10.0.0.1", "tcp", "gate-1");
        let outcome = session.merge_persisted(settings(&[("a", "1")]));

        assert_eq!(outcome, MergeOutcome::Adopted);
        assert!(!outcome.needs_write_back());
        assert_eq!(session.settings, settings(&[("a", "1")]));
    }

    #[test]
    fn live_value_wins_on_conflict() {
        let mut session = Session::new("s1", "10.0.0.1", "tcp", "gate-1");
        session.settings = settings(&[("a", "1")]);

        let outcome = session.merge_persisted(settings(&[("a", "2"), ("b", "3")]));

        assert_eq!(outcome, MergeOutcome::Merged { added: 1 });
        assert!(outcome.needs_write_back());
        assert_eq!(session.settings, settings(&[("a", "1"), ("b", "3")]));
    }

    #[test]
    fn nothing_new_means_no_write_back() {
        let mut session = Session::new("s1", "10.0.0.1", "tcp", "gate-1");
        session.settings = settings(&[("a", "1")]);

        let outcome = session.merge_persisted(settings(&[("a", "9")]));

        assert!(!outcome.needs_write_back());
        assert_eq!(session.settings, settings(&[("a", "1")]));
    }

    #[test]
    fn survives_the_wire() {
        let mut session = Session::new("s1", "10.0.0.1", "ws", "gate-1");
        session.user_id = "u1".into();
        session.settings = settings(&[("room", "7")]);

        let decoded = Session::from_bytes(&session.to_bytes()).unwrap();
        assert_eq!(decoded, session);
        assert!(decoded.is_bound());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

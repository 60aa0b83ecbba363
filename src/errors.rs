use thiserror::Error;

// -----------------------------------------------------------------------------
// ----- GateError -------------------------------------------------------------

/// Errors surfaced to callers of the session manager. The `Display` string is
/// what remote callers receive in `ResultInfo.error`.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("No Session found")]
    NotFound { session_id: String },

    #[error("The gateway did not find the corresponding userId [{user_id}]")]
    UserNotFound { user_id: String },

    #[error("{source}")]
    Transport {
        session_id: String,
        source: std::io::Error,
    },
}

impl GateError {
    pub fn not_found(session_id: &str) -> Self {
        GateError::NotFound {
            session_id: session_id.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- StorageError ----------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

// -----------------------------------------------------------------------------
// ----- BrokerError -----------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' not declared")]
    UnknownQueue(String),

    #[error("exchange '{0}' not declared")]
    UnknownExchange(String),

    #[error("queue '{queue}' already has consumer '{tag}'")]
    ConsumerExists { queue: String, tag: String },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("broker channel closed")]
    Closed,

    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),
}

// -----------------------------------------------------------------------------
// ----- RpcError --------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("envelope decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("call props carry no reply_to")]
    MissingReplyTo,

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("dispatch queue closed")]
    QueueClosed,
}

// -----------------------------------------------------------------------------
// ----- DispatchError ---------------------------------------------------------

/// Why a gate call produced an error result instead of a value.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("{method} expects {expected} arguments, got {got}")]
    Arity {
        method: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{method} argument {index} is not valid UTF-8")]
    BadArgument { method: &'static str, index: usize },

    #[error("settings payload: {0}")]
    BadSettings(#[from] prost::DecodeError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_is_caller_visible() {
        let err = GateError::not_found("s-1");
        assert_eq!(err.to_string(), "No Session found");
    }

    #[test]
    fn transport_error_carries_write_failure() {
        let err = GateError::Transport {
            session_id: "s-1".into(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone"),
        };
        assert_eq!(err.to_string(), "pipe gone");
    }

    #[test]
    fn user_not_found_names_the_user() {
        let err = GateError::UserNotFound {
            user_id: "u1".into(),
        };
        assert!(err.to_string().contains("[u1]"));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

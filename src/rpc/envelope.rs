use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use prost::Message;

use crate::errors::RpcError;

use super::server::Responder;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const PROP_REPLY_TO: &str = "reply_to";

// -----------------------------------------------------------------------------
// ----- RpcInfo ---------------------------------------------------------------

/// A remote call as it travels over the broker.
#[derive(Clone, PartialEq, Message)]
pub struct RpcInfo {
    /// Correlation id, echoed in the result.
    #[prost(string, tag = "1")]
    pub cid: String,

    #[prost(string, tag = "2")]
    pub method: String,

    #[prost(string, tag = "3")]
    pub reply_to: String,

    #[prost(string, tag = "4")]
    pub track: String,

    /// Unix seconds after which the call is stale; 0 never expires.
    #[prost(int64, tag = "5")]
    pub expired: i64,

    /// Whether the caller waits for a result.
    #[prost(bool, tag = "6")]
    pub reply: bool,

    #[prost(bytes = "vec", repeated, tag = "7")]
    pub args: Vec<Vec<u8>>,

    #[prost(string, repeated, tag = "8")]
    pub args_type: Vec<String>,
}

impl RpcInfo {
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    pub fn is_expired_at(&self, unix_secs: i64) -> bool {
        self.expired > 0 && self.expired < unix_secs
    }
}

pub fn decode_rpc_info(body: &[u8]) -> Result<RpcInfo, RpcError> {
    Ok(RpcInfo::decode(body)?)
}

// -----------------------------------------------------------------------------
// ----- ResultInfo ------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct ResultInfo {
    #[prost(string, tag = "1")]
    pub cid: String,

    /// Empty on success.
    #[prost(string, tag = "2")]
    pub error: String,

    #[prost(bytes = "vec", tag = "3")]
    pub result: Vec<u8>,

    #[prost(string, tag = "4")]
    pub result_type: String,
}

impl ResultInfo {
    pub fn success(cid: &str, result_type: &str, result: Vec<u8>) -> Self {
        Self {
            cid: cid.to_string(),
            error: String::new(),
            result,
            result_type: result_type.to_string(),
        }
    }

    pub fn failure(cid: &str, error: impl Into<String>) -> Self {
        Self {
            cid: cid.to_string(),
            error: error.into(),
            result: Vec::new(),
            result_type: String::new(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}

pub fn decode_result_info(body: &[u8]) -> Result<ResultInfo, RpcError> {
    Ok(ResultInfo::decode(body)?)
}

// -----------------------------------------------------------------------------
// ----- CallInfo --------------------------------------------------------------

/// One decoded call on its way through the dispatch queue.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub rpc_info: RpcInfo,
    pub props: HashMap<String, String>,
    pub result: ResultInfo,
    responder: Responder,
}

impl CallInfo {
    pub fn new(rpc_info: RpcInfo, responder: Responder) -> Self {
        let mut props = HashMap::with_capacity(1);
        props.insert(PROP_REPLY_TO.to_string(), rpc_info.reply_to.clone());

        Self {
            rpc_info,
            props,
            result: ResultInfo::default(),
            responder,
        }
    }

    /// `None` when the caller left no reply address.
    pub fn reply_to(&self) -> Option<&str> {
        self.props
            .get(PROP_REPLY_TO)
            .map(String::as_str)
            .filter(|dest| !dest.is_empty())
    }

    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);

        self.rpc_info.is_expired_at(now)
    }

    /// Attach `result` and publish it back through the originating server.
    pub async fn respond(mut self, result: ResultInfo) -> Result<(), RpcError> {
        self.result = result;
        self.responder.callback(&self).await
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------

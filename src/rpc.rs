use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(unix)]
pub const UNIX_PATH: &str = "/tmp/clickgreet.sock";
#[cfg(windows)]
pub const PIPE_PATH: &str = r"\\.\pipe\clickgreet";
pub const TCP_ADDR: &str = "0.0.0.0:5000";

/// Largest JSON body accepted in a single packet.
pub const MAX_PACKET: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcRequest {
    RegisterObject {
        object_name: String,
    },
    Call {
        call_id: CallId,
        object_name: String,
        method: String,
        args: Value,
    },
    HasObject {
        object_name: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcResponse {
    Registered {
        object_name: String,
    },
    Result {
        call_id: CallId,
        object_name: String,
        value: Value,
    },
    Error {
        call_id: Option<CallId>,
        message: String,
    },
    HasObjectResult {
        object_name: String,
        exists: bool,
    },
}

impl RpcResponse {
    /// The call this response answers, if any.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            RpcResponse::Result { call_id, .. } => Some(call_id),
            RpcResponse::Error { call_id, .. } => call_id.as_ref(),
            _ => None,
        }
    }
}

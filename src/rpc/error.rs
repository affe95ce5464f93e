use thiserror::Error;

/// Errors surfaced by [`super::client::RpcClient`].
///
/// Only [`RpcError::Transport`] is retried on the next endpoint. Everything
/// else describes a protocol mismatch and is returned to the caller as-is.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error on {url}: {message}")]
    Transport { url: String, message: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("all {attempted} endpoints failed, last error: {last}")]
    AllEndpointsFailed { attempted: usize, last: String },

    #[error("no endpoints configured")]
    NoEndpoints,
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport { .. })
    }

    /// The node could not be reached at all, as opposed to answering with
    /// an error.
    pub fn is_outage(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. } | RpcError::AllEndpointsFailed { .. } | RpcError::NoEndpoints
        )
    }

    /// JSON-RPC "method not found" or "method not supported" style failures.
    pub fn is_unsupported_method(&self) -> bool {
        match self {
            RpcError::Rpc { code, message } => {
                let lowered = message.to_lowercase();
                *code == -32601
                    || lowered.contains("not supported")
                    || lowered.contains("does not exist")
                    || lowered.contains("not found")
                    || lowered.contains("not available")
            }
            _ => false,
        }
    }

    pub fn transport(url: &str, message: impl std::fmt::Display) -> Self {
        RpcError::Transport {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}

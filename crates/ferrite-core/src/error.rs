//! Client-side error taxonomy.
//!
//! Variants are cloneable: a single transport failure fans out to every
//! pending call, and a cached dial failure is handed to every caller that
//! coalesced on the same endpoint.

use ferrite_protocol::WireError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The client was closed before or during the send.
    #[error("connection is shut down")]
    Shutdown,
    /// The call was cancelled locally while awaiting its response.
    #[error("cancelled while waiting for receiving")]
    WaitingForReceiving,
    /// The dial deadline elapsed before negotiation completed.
    #[error("connect deadline exceeded")]
    DialTimeout,
    /// The target is not of the form `<Service>:<Method>`.
    #[error("illegal target method `{0}`")]
    IllegalTargetMethod(String),
    /// The registry returned no address for the service name.
    #[error("no available service instance")]
    NoAvailableInstance,
    /// Error text carried back in a response envelope.
    #[error("{0}")]
    Remote(String),
    /// Connection setup or I/O failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Registry lookup or registration failure.
    #[error("registry error: {0}")]
    Registry(String),
    /// The reply payload did not decode into the requested type.
    #[error("reply decode error: {0}")]
    ReplyDecode(String),
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => RpcError::Shutdown,
            other => RpcError::Transport(other.to_string()),
        }
    }
}

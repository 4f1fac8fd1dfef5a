// ferrite-registry: service registry with heartbeat-driven liveness and
// push-based update notifications.
//
// The registry speaks plain HTTP: scalar parameters travel in headers,
// address lists as JSON bodies. A registered service keeps itself alive by
// periodic heartbeats; missing three ticks evicts it. Peers that looked a
// name up are pushed fresh address lists whenever that name's membership
// changes, with explicit lookup as the recovery path for lost pushes.

pub mod client;
mod record;
pub mod server;

pub use client::RegistryClient;
pub use server::RegistryServer;

/// Registration and lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Heartbeat periods below one second are rejected.
    #[error("tick must larger than 1s")]
    TickTooSmall,
    #[error("client already closed")]
    AlreadyClosed,
    #[error("registry request failed: {0}")]
    Http(String),
    #[error("registry returned status {0}")]
    Status(u16),
    #[error("missing or invalid id header")]
    BadId,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("address payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Http(err.to_string())
    }
}

// ferrite-core: RPC client, server, and service dispatch.
//
// The server hosts named services built with `ServiceBuilder` and speaks
// the ferrite-protocol wire format over TCP. The client tracks in-flight
// calls with per-call cancellation, an optional keep-alive sender, and
// idempotent teardown. The balanced client resolves service names through
// a registry and multiplexes over cached per-endpoint clients.

pub mod balanced;
pub mod client;
pub mod error;
pub mod server;
pub mod service;

pub use balanced::BalancedClient;
pub use client::{Call, CallStatus, Client, ClientConfig};
pub use error::RpcError;
pub use server::{Server, ServerConfig, SERVICE_NOT_FOUND, SERVICE_TIMEOUT};
pub use service::{DefineError, DispatchError, Service, ServiceBuilder};

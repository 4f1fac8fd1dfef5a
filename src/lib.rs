// ferrite: a small distributed-RPC substrate.
//
// Facade over the workspace crates: wire protocol and codecs
// (ferrite-protocol), RPC client/server/dispatch (ferrite-core), and the
// service registry (ferrite-registry).

pub use ferrite_core::{
    BalancedClient, Call, CallStatus, Client, ClientConfig, DefineError, DispatchError, RpcError,
    Server, ServerConfig, Service, ServiceBuilder, SERVICE_NOT_FOUND, SERVICE_TIMEOUT,
};
pub use ferrite_registry::{RegistryClient, RegistryError, RegistryServer};

pub mod protocol {
    pub use ferrite_protocol::*;
}

//! Tunnel engine
//!
//! The encrypted proxying and packet forwarding live outside this crate.
//! The session controller drives them through [`TunnelEngine`].

use thiserror::Error;

use crate::descriptor::ServerDescriptor;
use crate::platform::InterfaceHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("Connectivity check failed: {0}")]
    Probe(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

/// All methods may block; the controller calls them off the async workers.
pub trait TunnelEngine: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Construct a proxy client. Malformed cipher, port, etc. fail here.
    fn build_client(&self, descriptor: &ServerDescriptor) -> Result<Self::Client, EngineError>;

    /// Pre-flight check against the server. Returns the numeric probe code
    /// (0 for no error, see [`ErrorKind`](crate::session::ErrorKind)).
    fn check_connectivity(&self, client: &Self::Client) -> Result<i64, EngineError>;

    /// Start moving packets between `interface` and the proxy connection.
    fn connect(
        &self,
        client: &Self::Client,
        interface: &InterfaceHandle,
        enable_udp_forwarding: bool,
    ) -> Result<(), EngineError>;

    fn disconnect(&self);
}

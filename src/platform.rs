//! Platform VPN plumbing
//!
//! The host OS grants the virtual interface and keeps the service alive in
//! the foreground. On Android this is backed by `VpnService`; the app
//! implements [`VpnPlatform`] and hands it to the session controller.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::config::RoutingRules;

/// Opaque handle of a virtual interface, usually a TUN file descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    fd: i32,
}

impl InterfaceHandle {
    pub fn new(fd: i32) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("VPN permission denied")]
    Denied,

    #[error("Platform failure: {0}")]
    Failed(String),
}

pub trait VpnPlatform: Send + Sync + 'static {
    /// Ask for a virtual interface configured with `routing`.
    fn request_interface(&self, routing: &RoutingRules) -> Result<InterfaceHandle, PlatformError>;

    fn release_interface(&self, interface: InterfaceHandle);

    /// Show the persistent notification that keeps the service alive.
    fn start_foreground(&self) -> Result<(), PlatformError>;

    fn stop_foreground(&self);
}

/// Action tokens the platform service is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "action.start",
            ServiceAction::Stop => "action.stop",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action.start" => Ok(ServiceAction::Start),
            "action.stop" => Ok(ServiceAction::Stop),
            other => Err(format!("unknown service action: {}", other)),
        }
    }
}

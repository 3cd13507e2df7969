//! Configuration types for Outline Core

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default MTU of the virtual interface
pub const MTU: usize = 1500;

/// Settings of the HTTP fetcher used for `ssconf://` keys.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    /// `None` leaves the request unbounded.
    pub timeout: Option<Duration>,
    pub require_json_content_type: bool,
}

impl FetcherConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_json_content_type(mut self, required: bool) -> Self {
        self.require_json_content_type = required;
        self
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("outline-core/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Some(Duration::from_secs(10)),
            require_json_content_type: true,
        }
    }
}

/// What the platform is asked for when a virtual interface is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRules {
    pub session_name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: usize,
    pub dns_servers: Vec<IpAddr>,
    /// Application identifiers whose traffic bypasses the tunnel
    pub excluded_apps: Vec<String>,
}

impl RoutingRules {
    pub fn with_dns(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn exclude_app(mut self, app: impl Into<String>) -> Self {
        let app = app.into();
        if !self.excluded_apps.contains(&app) {
            self.excluded_apps.push(app);
        }
        self
    }
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self {
            session_name: "Outline".into(),
            address: Ipv4Addr::new(10, 111, 222, 1),
            prefix_len: 24,
            mtu: MTU,
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
                IpAddr::V4(Ipv4Addr::new(208, 67, 222, 222)),
                IpAddr::V4(Ipv4Addr::new(208, 67, 220, 220)),
            ],
            excluded_apps: Vec::new(),
        }
    }
}

/// Per-start switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub enable_udp_forwarding: bool,
    pub skip_connectivity_probe: bool,
}

impl SessionOptions {
    /// Reconnect-on-boot: the descriptor was already validated by an
    /// earlier session, so the connectivity probe is skipped.
    pub fn auto_reconnect() -> Self {
        Self {
            skip_connectivity_probe: true,
            ..Self::default()
        }
    }

    pub fn with_udp_forwarding(mut self, enabled: bool) -> Self {
        self.enable_udp_forwarding = enabled;
        self
    }
}

/// Everything the FFI layer needs to bring the core up.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub fetcher: FetcherConfig,
    pub routing: RoutingRules,
    pub session: SessionOptions,
}

//! Outline Core - Shadowsocks VPN client core for the Android/iOS Outline app
//!
//! This crate turns access keys (`ss://` and `ssconf://`) into server
//! descriptors and drives the single VPN session through the tunnel engine
//! and the platform VPN service supplied by the app.

// Public modules
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod ffi;
pub mod geo;
pub mod parser;
pub mod platform;
pub mod servers;
pub mod session;
pub mod validator;

// Re-exports for convenience
pub use config::{CoreConfig, FetcherConfig, RoutingRules, SessionOptions, MTU};
pub use descriptor::ServerDescriptor;
pub use engine::{EngineError, TunnelEngine};
pub use error::{FetchError, OutlineError, Result};
pub use fetch::{HttpFetcher, RemoteFetcher};
pub use geo::{CountryCodeProvider, FlagIconProvider};
pub use parser::{extract_server_host, DescriptorParser};
pub use platform::{InterfaceHandle, PlatformError, ServiceAction, VpnPlatform};
pub use servers::{ServerEntry, ServerList};
pub use session::{ErrorKind, SessionController, SessionEvent, SessionPhase, SessionState};
pub use validator::{validate, ValidationResult};

use std::sync::Arc;

/// The main core: configuration plus an access-key parser.
pub struct OutlineCore<F = HttpFetcher> {
    config: CoreConfig,
    parser: DescriptorParser<F>,
}

impl OutlineCore<HttpFetcher> {
    /// Create a core fetching `ssconf://` documents over HTTPS.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.fetcher.clone())?;
        Ok(Self::with_fetcher(config, fetcher))
    }
}

impl<F: RemoteFetcher> OutlineCore<F> {
    pub fn with_fetcher(config: CoreConfig, fetcher: F) -> Self {
        log::info!(
            "Creating OutlineCore (session '{}', mtu {})",
            config.routing.session_name,
            config.routing.mtu
        );
        Self {
            config,
            parser: DescriptorParser::new(fetcher),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn validate(&self, uri: &str) -> bool {
        validator::validate(uri)
    }

    pub async fn parse(&self, uri: &str) -> Result<ServerDescriptor> {
        self.parser.parse(uri).await
    }

    /// Spawn the session worker on the current runtime.
    pub fn session<E, P>(&self, engine: Arc<E>, platform: Arc<P>) -> SessionController
    where
        E: TunnelEngine,
        P: VpnPlatform,
    {
        SessionController::new(engine, platform, self.config.routing.clone())
    }

    /// Parse `uri` and ask `session` to start with it using the configured
    /// session options. A key that does not parse never reaches the session.
    pub async fn connect(&self, session: &SessionController, uri: &str) -> Result<()> {
        let descriptor = self.parse(uri).await?;
        session.start_with(descriptor, self.config.session);
        Ok(())
    }
}

// UniFFI scaffolding
uniffi::setup_scaffolding!();

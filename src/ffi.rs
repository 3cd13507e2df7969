//! FFI (Foreign Function Interface) Module
//!
//! Surface exported to the Android and iOS apps through UniFFI. The app
//! supplies the tunnel engine and the platform VPN service as callback
//! interfaces; the session controller lives here as a process-wide
//! singleton driven by its own tokio runtime.
//!
//! Nothing here blocks on the runtime. Remote key fetches run as tasks on
//! it, and observer callbacks are delivered from a dedicated thread so the
//! app may call back into this module from `on_event`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock};
use std::thread;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{FetcherConfig, RoutingRules, SessionOptions};
use crate::descriptor::ServerDescriptor;
use crate::engine::{EngineError, TunnelEngine};
use crate::error::OutlineError;
use crate::fetch::HttpFetcher;
use crate::parser::{self, DescriptorParser, INDIRECTION_SCHEME};
use crate::platform::{InterfaceHandle, PlatformError, ServiceAction, VpnPlatform};
use crate::session::{ErrorKind, SessionController, SessionEvent, SessionPhase};
use crate::validator;

/// Runtime backing the session worker and remote key fetches
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Global session instance
static SESSION: OnceLock<SessionController> = OnceLock::new();

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum FfiError {
    #[error("Session not initialized")]
    NotInitialized,

    #[error("Session already initialized")]
    AlreadyInitialized,

    #[error("Invalid access key: {0}")]
    InvalidAccessKey(String),

    #[error("Remote access key unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<OutlineError> for FfiError {
    fn from(err: OutlineError) -> Self {
        match err {
            OutlineError::NotInitialized => FfiError::NotInitialized,
            OutlineError::AlreadyInitialized => FfiError::AlreadyInitialized,
            OutlineError::InvalidDescriptor(_) | OutlineError::MalformedEncoding(_) => {
                FfiError::InvalidAccessKey(err.to_string())
            }
            OutlineError::Fetch(e) => FfiError::Unavailable(e.to_string()),
            OutlineError::ConfigError(reason) => FfiError::InvalidConfig(reason),
            OutlineError::LockError | OutlineError::Runtime(_) => FfiError::Runtime(err.to_string()),
        }
    }
}

/// Server descriptor as seen by the app
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct FfiServerConfig {
    pub method: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub prefix: Option<Vec<u8>>,
    /// Display name from the key's fragment, if any
    pub name: Option<String>,
}

impl FfiServerConfig {
    fn from_descriptor(descriptor: &ServerDescriptor, name: Option<String>) -> Self {
        Self {
            method: descriptor.method().to_string(),
            password: descriptor.password().to_string(),
            host: descriptor.host().to_string(),
            port: descriptor.port(),
            prefix: descriptor.prefix().map(<[u8]>::to_vec),
            name,
        }
    }

    fn into_descriptor(self) -> Result<ServerDescriptor, FfiError> {
        let descriptor = ServerDescriptor::new(self.method, self.password, self.host, self.port)?;
        Ok(match self.prefix {
            Some(prefix) => descriptor.with_prefix(prefix),
            None => descriptor,
        })
    }
}

/// Interface settings handed to the platform when the tunnel comes up
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct FfiRoutingConfig {
    pub session_name: String,
    pub address: String,
    pub prefix_len: u8,
    pub mtu: u32,
    pub dns_servers: Vec<String>,
    pub excluded_apps: Vec<String>,
}

impl From<&RoutingRules> for FfiRoutingConfig {
    fn from(rules: &RoutingRules) -> Self {
        Self {
            session_name: rules.session_name.clone(),
            address: rules.address.to_string(),
            prefix_len: rules.prefix_len,
            mtu: u32::try_from(rules.mtu).unwrap_or(u32::MAX),
            dns_servers: rules.dns_servers.iter().map(ToString::to_string).collect(),
            excluded_apps: rules.excluded_apps.clone(),
        }
    }
}

impl TryFrom<FfiRoutingConfig> for RoutingRules {
    type Error = FfiError;

    fn try_from(config: FfiRoutingConfig) -> Result<Self, Self::Error> {
        let address: Ipv4Addr = config
            .address
            .parse()
            .map_err(|_| FfiError::InvalidConfig(format!("invalid address: {}", config.address)))?;
        if config.prefix_len > 32 {
            return Err(FfiError::InvalidConfig(format!(
                "invalid prefix length: {}",
                config.prefix_len
            )));
        }
        let dns_servers = config
            .dns_servers
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| FfiError::InvalidConfig(format!("invalid DNS server: {}", s)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rules = RoutingRules {
            session_name: config.session_name,
            address,
            prefix_len: config.prefix_len,
            ..RoutingRules::default()
        }
        .with_mtu(usize::try_from(config.mtu).unwrap_or(usize::MAX))
        .with_dns(dns_servers);
        for app in config.excluded_apps {
            rules = rules.exclude_app(app);
        }
        Ok(rules)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSessionPhase {
    Idle,
    Starting,
    Connected,
    Stopping,
}

impl From<SessionPhase> for FfiSessionPhase {
    fn from(phase: SessionPhase) -> Self {
        match phase {
            SessionPhase::Idle => FfiSessionPhase::Idle,
            SessionPhase::Starting => FfiSessionPhase::Starting,
            SessionPhase::Connected => FfiSessionPhase::Connected,
            SessionPhase::Stopping => FfiSessionPhase::Stopping,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSessionEvent {
    Started,
    Stopped,
    Error { code: i32 },
}

impl From<SessionEvent> for FfiSessionEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Started => FfiSessionEvent::Started,
            SessionEvent::Stopped => FfiSessionEvent::Stopped,
            SessionEvent::Error(kind) => FfiSessionEvent::Error { code: kind.code() },
        }
    }
}

/// Tunnel engine implemented by the app (Shadowsocks client + tun2socks).
#[uniffi::export(callback_interface)]
pub trait EngineBridge: Send + Sync {
    /// Returns a client handle, `None` if the configuration is rejected.
    fn build_client(&self, config: FfiServerConfig) -> Option<u64>;

    fn release_client(&self, client: u64);

    /// Probe code, 0 for no error.
    fn check_connectivity(&self, client: u64) -> i64;

    fn connect(&self, client: u64, tun_fd: i32, enable_udp_forwarding: bool) -> bool;

    fn disconnect(&self);
}

/// VPN service of the host OS.
#[uniffi::export(callback_interface)]
pub trait PlatformBridge: Send + Sync {
    /// Returns the TUN file descriptor, `None` if the interface was refused.
    fn request_interface(&self, routing: FfiRoutingConfig) -> Option<i32>;

    fn release_interface(&self, tun_fd: i32);

    fn start_foreground(&self) -> bool;

    fn stop_foreground(&self);
}

#[uniffi::export(callback_interface)]
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: FfiSessionEvent);
}

/// Client owned by the app, released when the session drops it.
pub struct BridgeClient {
    handle: u64,
    bridge: Arc<dyn EngineBridge>,
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.bridge.release_client(self.handle);
    }
}

struct BridgeEngine {
    bridge: Arc<dyn EngineBridge>,
}

impl TunnelEngine for BridgeEngine {
    type Client = BridgeClient;

    fn build_client(&self, descriptor: &ServerDescriptor) -> Result<BridgeClient, EngineError> {
        let config = FfiServerConfig::from_descriptor(descriptor, None);
        let handle = self
            .bridge
            .build_client(config)
            .ok_or_else(|| EngineError::InvalidConfig("rejected by the engine".into()))?;
        Ok(BridgeClient {
            handle,
            bridge: Arc::clone(&self.bridge),
        })
    }

    fn check_connectivity(&self, client: &BridgeClient) -> Result<i64, EngineError> {
        Ok(self.bridge.check_connectivity(client.handle))
    }

    fn connect(
        &self,
        client: &BridgeClient,
        interface: &InterfaceHandle,
        enable_udp_forwarding: bool,
    ) -> Result<(), EngineError> {
        if self
            .bridge
            .connect(client.handle, interface.fd(), enable_udp_forwarding)
        {
            Ok(())
        } else {
            Err(EngineError::Tunnel("engine failed to connect".into()))
        }
    }

    fn disconnect(&self) {
        self.bridge.disconnect();
    }
}

struct BridgePlatform {
    bridge: Box<dyn PlatformBridge>,
}

impl VpnPlatform for BridgePlatform {
    fn request_interface(&self, routing: &RoutingRules) -> Result<InterfaceHandle, PlatformError> {
        self.bridge
            .request_interface(FfiRoutingConfig::from(routing))
            .map(InterfaceHandle::new)
            .ok_or(PlatformError::Denied)
    }

    fn release_interface(&self, interface: InterfaceHandle) {
        self.bridge.release_interface(interface.fd());
    }

    fn start_foreground(&self) -> Result<(), PlatformError> {
        if self.bridge.start_foreground() {
            Ok(())
        } else {
            Err(PlatformError::Failed("foreground service refused".into()))
        }
    }

    fn stop_foreground(&self) {
        self.bridge.stop_foreground();
    }
}

fn runtime() -> Result<&'static Runtime, FfiError> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("outline-core")
        .enable_all()
        .build()
        .map_err(|e| FfiError::Runtime(format!("Failed to start runtime: {}", e)))?;
    if let Err(unused) = RUNTIME.set(runtime) {
        // Lost the race; this may run inside an async context.
        unused.shutdown_background();
    }
    RUNTIME
        .get()
        .ok_or_else(|| FfiError::Runtime("runtime unavailable".into()))
}

fn session() -> Result<&'static SessionController, FfiError> {
    SESSION.get().ok_or(FfiError::NotInitialized)
}

/// Route `log` output to stderr (logcat/os_log capture it). Safe to call
/// more than once.
#[uniffi::export]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[uniffi::export]
pub fn validate_uri(uri: String) -> bool {
    validator::validate(&uri)
}

#[uniffi::export]
pub fn extract_server_host(uri: String) -> Option<String> {
    parser::extract_server_host(&uri)
}

/// Parse an access key, fetching `ssconf://` documents on the core runtime.
#[uniffi::export]
pub async fn parse_uri(uri: String) -> Result<FfiServerConfig, FfiError> {
    let (descriptor, name) = runtime()?
        .spawn(async move { resolve(&uri).await })
        .await
        .map_err(|e| FfiError::Runtime(format!("Access key task failed: {}", e)))??;
    Ok(FfiServerConfig::from_descriptor(&descriptor, name))
}

async fn resolve(uri: &str) -> Result<(ServerDescriptor, Option<String>), OutlineError> {
    let fetcher = HttpFetcher::new(FetcherConfig::default())?;
    DescriptorParser::new(fetcher).parse_named(uri).await
}

/// Install the process-wide session controller.
#[uniffi::export]
pub fn init_session(
    engine: Box<dyn EngineBridge>,
    platform: Box<dyn PlatformBridge>,
    observer: Option<Box<dyn SessionObserver>>,
    routing: Option<FfiRoutingConfig>,
) -> Result<(), FfiError> {
    if SESSION.get().is_some() {
        return Err(FfiError::AlreadyInitialized);
    }

    let routing = match routing {
        Some(config) => RoutingRules::try_from(config)?,
        None => RoutingRules::default(),
    };
    let runtime = runtime()?;

    let engine = Arc::new(BridgeEngine {
        bridge: Arc::from(engine),
    });
    let platform = Arc::new(BridgePlatform { bridge: platform });
    let controller = SessionController::spawn(runtime.handle(), engine, platform, routing);

    if let Some(observer) = observer {
        let mut events = controller.subscribe();
        let spawned = thread::Builder::new()
            .name("outline-observer".into())
            .spawn(move || loop {
                match events.blocking_recv() {
                    Ok(event) => observer.on_event(event.into()),
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Session observer missed {} events", missed)
                    }
                    Err(RecvError::Closed) => break,
                }
            });
        if let Err(e) = spawned {
            controller.shutdown();
            return Err(FfiError::Runtime(format!("Failed to start observer thread: {}", e)));
        }
    }

    SESSION.set(controller).map_err(|controller| {
        controller.shutdown();
        FfiError::AlreadyInitialized
    })?;

    log::info!("Outline session initialized");
    Ok(())
}

/// Start a session from an access key. Returns without waiting.
///
/// `ss://` keys are parsed on the spot and a malformed one is returned as
/// an error. `ssconf://` keys are fetched on the core runtime; if that
/// fails, observers get `ILLEGAL_SERVER_CONFIGURATION`.
#[uniffi::export]
pub fn start_session(uri: String, enable_udp_forwarding: bool) -> Result<(), FfiError> {
    let session = session()?;
    let options = SessionOptions::default().with_udp_forwarding(enable_udp_forwarding);
    let uri = uri.trim().to_string();

    if !uri.starts_with(INDIRECTION_SCHEME) {
        let (descriptor, _) = parser::parse_direct(&uri)?;
        session.start_with(descriptor, options);
        return Ok(());
    }

    runtime()?.spawn(async move {
        match resolve(&uri).await {
            Ok((descriptor, _)) => session.start_with(descriptor, options),
            Err(e) => {
                log::error!("Failed to resolve access key: {}", e);
                session.reject(ErrorKind::IllegalServerConfiguration);
            }
        }
    });
    Ok(())
}

/// Start with an already parsed configuration. `auto_reconnect` skips the
/// connectivity probe (boot and process restart).
#[uniffi::export]
pub fn start_session_with_config(
    config: FfiServerConfig,
    enable_udp_forwarding: bool,
    auto_reconnect: bool,
) -> Result<(), FfiError> {
    let session = session()?;
    let options = if auto_reconnect {
        SessionOptions::auto_reconnect()
    } else {
        SessionOptions::default()
    };
    session.start_with(
        config.into_descriptor()?,
        options.with_udp_forwarding(enable_udp_forwarding),
    );
    Ok(())
}

/// Forward an intent action token (`action.start` / `action.stop`).
#[uniffi::export]
pub fn handle_service_action(
    action: String,
    config: Option<FfiServerConfig>,
) -> Result<(), FfiError> {
    let session = session()?;
    let action: ServiceAction = action.parse().map_err(FfiError::InvalidConfig)?;
    let descriptor = config.map(FfiServerConfig::into_descriptor).transpose()?;
    session.dispatch(action, descriptor);
    Ok(())
}

#[uniffi::export]
pub fn stop_session() -> Result<(), FfiError> {
    session()?.stop();
    Ok(())
}

/// The OS revoked the VPN permission.
#[uniffi::export]
pub fn revoke_session() -> Result<(), FfiError> {
    session()?.on_revoke();
    Ok(())
}

#[uniffi::export]
pub fn is_connected() -> bool {
    SESSION.get().is_some_and(SessionController::is_connected)
}

#[uniffi::export]
pub fn session_phase() -> Result<FfiSessionPhase, FfiError> {
    Ok(session()?.state().phase.into())
}

/// Code of the last failed start, if the session is idle after a failure.
#[uniffi::export]
pub fn last_error_code() -> Result<Option<i32>, FfiError> {
    Ok(session()?.state().last_error.map(ErrorKind::code))
}

/// Wire name of an error code, e.g. `SERVER_UNREACHABLE` for 5.
#[uniffi::export]
pub fn error_code_name(code: i32) -> String {
    match ErrorKind::from_probe_code(code as i64) {
        Some(kind) => kind.name().to_string(),
        None => "NO_ERROR".to_string(),
    }
}

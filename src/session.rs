//! Session Controller
//!
//! Owns the single tunnel session. Requests are queued to one worker task
//! which services them in order, so a start and a stop never run
//! concurrently. Collaborator calls block and run on the blocking pool.
//!
//! ```text
//!   Idle ──start──▶ Starting ──ok──▶ Connected
//!    ▲                 │                 │
//!    └──── failure ────┘                 │
//!    └──────────── Stopping ◀── stop ────┘
//! ```
//!
//! A command arriving while a start is in flight is checked for between
//! start steps; it aborts the start, whatever was already acquired is
//! released, and the command then runs. Stopping is the only cancellation
//! mechanism.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::{RoutingRules, SessionOptions};
use crate::descriptor::ServerDescriptor;
use crate::engine::TunnelEngine;
use crate::platform::{InterfaceHandle, ServiceAction, VpnPlatform};

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 32;

/// Session failure codes.
///
/// The numeric values are shared with the probe of the tunnel engine and
/// with the app's error model; they must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    Unexpected = 1,
    VpnPermissionNotGranted = 2,
    InvalidServerCredentials = 3,
    /// Proxy reachable without UDP relay; TCP-only sessions still work.
    UdpRelayNotEnabled = 4,
    ServerUnreachable = 5,
    VpnStartFailure = 6,
    IllegalServerConfiguration = 7,
    ShadowsocksStartFailure = 8,
    ConfigureSystemProxyFailure = 9,
    NoAdminPermissions = 10,
    UnsupportedRoutingTable = 11,
    SystemMisconfigured = 12,
}

impl ErrorKind {
    /// Probe code meaning success
    pub const NO_ERROR: i64 = 0;

    const ALL: [ErrorKind; 12] = [
        ErrorKind::Unexpected,
        ErrorKind::VpnPermissionNotGranted,
        ErrorKind::InvalidServerCredentials,
        ErrorKind::UdpRelayNotEnabled,
        ErrorKind::ServerUnreachable,
        ErrorKind::VpnStartFailure,
        ErrorKind::IllegalServerConfiguration,
        ErrorKind::ShadowsocksStartFailure,
        ErrorKind::ConfigureSystemProxyFailure,
        ErrorKind::NoAdminPermissions,
        ErrorKind::UnsupportedRoutingTable,
        ErrorKind::SystemMisconfigured,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a probe code. `None` for [`NO_ERROR`](Self::NO_ERROR); codes
    /// outside the known range clamp to [`Unexpected`](Self::Unexpected).
    pub fn from_probe_code(code: i64) -> Option<ErrorKind> {
        if code == Self::NO_ERROR {
            return None;
        }
        let kind = code
            .checked_sub(1)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| Self::ALL.get(index).copied())
            .unwrap_or(ErrorKind::Unexpected);
        Some(kind)
    }

    /// Whether a probe returning this kind aborts the start.
    pub fn is_fatal(self) -> bool {
        self != ErrorKind::UdpRelayNotEnabled
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Unexpected => "UNEXPECTED",
            ErrorKind::VpnPermissionNotGranted => "VPN_PERMISSION_NOT_GRANTED",
            ErrorKind::InvalidServerCredentials => "INVALID_SERVER_CREDENTIALS",
            ErrorKind::UdpRelayNotEnabled => "UDP_RELAY_NOT_ENABLED",
            ErrorKind::ServerUnreachable => "SERVER_UNREACHABLE",
            ErrorKind::VpnStartFailure => "VPN_START_FAILURE",
            ErrorKind::IllegalServerConfiguration => "ILLEGAL_SERVER_CONFIGURATION",
            ErrorKind::ShadowsocksStartFailure => "SHADOWSOCKS_START_FAILURE",
            ErrorKind::ConfigureSystemProxyFailure => "CONFIGURE_SYSTEM_PROXY_FAILURE",
            ErrorKind::NoAdminPermissions => "NO_ADMIN_PERMISSIONS",
            ErrorKind::UnsupportedRoutingTable => "UNSUPPORTED_ROUTING_TABLE",
            ErrorKind::SystemMisconfigured => "SYSTEM_MISCONFIGURED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    Connected,
    Stopping,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Failure of the most recent start, cleared when the next one begins
    pub last_error: Option<ErrorKind>,
}

/// Lifecycle notifications pushed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Stopped,
    Error(ErrorKind),
}

#[derive(Debug)]
enum SessionCommand {
    Start {
        descriptor: Option<ServerDescriptor>,
        options: SessionOptions,
    },
    Stop,
    Reject(ErrorKind),
    Shutdown,
}

/// Handle to the session worker. Every method returns immediately.
pub struct SessionController {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new<E, P>(engine: Arc<E>, platform: Arc<P>, routing: RoutingRules) -> Self
    where
        E: TunnelEngine,
        P: VpnPlatform,
    {
        Self::spawn(&Handle::current(), engine, platform, routing)
    }

    /// Spawn the worker on `runtime`.
    pub fn spawn<E, P>(runtime: &Handle, engine: Arc<E>, platform: Arc<P>, routing: RoutingRules) -> Self
    where
        E: TunnelEngine,
        P: VpnPlatform,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let worker = Worker {
            engine,
            platform,
            routing,
            commands: command_rx,
            pending: VecDeque::new(),
            state: state_tx,
            events: event_tx.clone(),
            resources: Resources::default(),
        };
        runtime.spawn(worker.run());

        Self {
            commands: command_tx,
            state: state_rx,
            events: event_tx,
        }
    }

    pub fn start(&self, descriptor: ServerDescriptor) {
        self.start_with(descriptor, SessionOptions::default());
    }

    pub fn start_with(&self, descriptor: ServerDescriptor, options: SessionOptions) {
        log::info!("Start requested for {}", descriptor.server_address());
        self.send(SessionCommand::Start {
            descriptor: Some(descriptor),
            options,
        });
    }

    pub fn stop(&self) {
        log::info!("Stop requested");
        self.send(SessionCommand::Stop);
    }

    /// Entry point for the platform service's action tokens.
    pub fn dispatch(&self, action: ServiceAction, descriptor: Option<ServerDescriptor>) {
        match action {
            ServiceAction::Start => self.send(SessionCommand::Start {
                descriptor,
                options: SessionOptions::default(),
            }),
            ServiceAction::Stop => self.stop(),
        }
    }

    /// Report a start request that failed before it reached the session,
    /// such as an `ssconf://` document that could not be fetched. Observers
    /// get `Error(kind)`; a running session is left alone.
    pub fn reject(&self, kind: ErrorKind) {
        log::warn!("Start request rejected: {}", kind);
        self.send(SessionCommand::Reject(kind));
    }

    /// The platform revoked the VPN (another VPN app took over).
    pub fn on_revoke(&self) {
        log::info!("VPN revoked by the platform");
        self.stop();
    }

    /// Stop any session and end the worker.
    pub fn shutdown(&self) {
        self.send(SessionCommand::Shutdown);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().phase == SessionPhase::Connected
    }

    /// Events from now on; nothing is replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Session worker is gone, command dropped");
        }
    }
}

/// Everything a (possibly partial) start has acquired.
struct Resources<C> {
    client: Option<Arc<C>>,
    interface: Option<InterfaceHandle>,
    tunnel_connected: bool,
    foreground: bool,
}

impl<C> Default for Resources<C> {
    fn default() -> Self {
        Self {
            client: None,
            interface: None,
            tunnel_connected: false,
            foreground: false,
        }
    }
}

impl<C> Resources<C> {
    fn is_empty(&self) -> bool {
        self.client.is_none() && self.interface.is_none() && !self.tunnel_connected && !self.foreground
    }
}

enum StartAbort {
    Failed(ErrorKind),
    /// Another command arrived; it sits in `pending`.
    Interrupted,
}

struct Worker<E: TunnelEngine, P: VpnPlatform> {
    engine: Arc<E>,
    platform: Arc<P>,
    routing: RoutingRules,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    pending: VecDeque<SessionCommand>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    resources: Resources<E::Client>,
}

impl<E: TunnelEngine, P: VpnPlatform> Worker<E, P> {
    async fn run(mut self) {
        loop {
            let command = match self.pending.pop_front() {
                Some(command) => command,
                None => match self.commands.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                SessionCommand::Start { descriptor, options } => {
                    self.handle_start(descriptor, options).await
                }
                SessionCommand::Stop => self.teardown().await,
                SessionCommand::Reject(kind) => self.reject(kind),
                SessionCommand::Shutdown => break,
            }
        }

        self.teardown().await;
        log::info!("Session worker exited");
    }

    async fn handle_start(&mut self, descriptor: Option<ServerDescriptor>, options: SessionOptions) {
        if self.phase() != SessionPhase::Idle || !self.resources.is_empty() {
            log::info!("Stopping the current session before starting a new one");
            self.teardown().await;
        }

        let Some(descriptor) = descriptor else {
            log::error!("Start requested without a server configuration");
            self.fail(ErrorKind::Unexpected);
            return;
        };

        self.set_state(SessionPhase::Starting, None);

        match self.establish(descriptor, options).await {
            Ok(()) => {
                self.set_state(SessionPhase::Connected, None);
                self.enter_foreground().await;
                log::info!("VPN tunnel established");
                self.emit(SessionEvent::Started);
            }
            Err(StartAbort::Failed(kind)) => {
                self.release().await;
                self.fail(kind);
            }
            Err(StartAbort::Interrupted) => {
                log::info!("Start interrupted by a newer request");
                self.teardown().await;
            }
        }
    }

    async fn establish(
        &mut self,
        descriptor: ServerDescriptor,
        options: SessionOptions,
    ) -> Result<(), StartAbort> {
        let engine = Arc::clone(&self.engine);
        let client = run_blocking(move || engine.build_client(&descriptor))
            .await?
            .map_err(|e| {
                log::error!("Invalid client configuration: {}", e);
                StartAbort::Failed(ErrorKind::ShadowsocksStartFailure)
            })?;
        let client = Arc::new(client);
        self.resources.client = Some(Arc::clone(&client));
        self.check_interrupt()?;

        if options.skip_connectivity_probe {
            log::debug!("Skipping connectivity probe");
        } else {
            let engine = Arc::clone(&self.engine);
            let probe_client = Arc::clone(&client);
            let code = match run_blocking(move || engine.check_connectivity(&probe_client)).await? {
                Ok(code) => code,
                Err(e) => {
                    log::error!("Connectivity check failed: {}", e);
                    ErrorKind::Unexpected.code() as i64
                }
            };
            match ErrorKind::from_probe_code(code) {
                None => log::info!("Connectivity check passed"),
                Some(kind) if !kind.is_fatal() => {
                    log::info!("Connectivity check: {}, continuing over TCP only", kind)
                }
                Some(kind) => {
                    log::error!("Connectivity check failed with {}", kind);
                    return Err(StartAbort::Failed(kind));
                }
            }
            self.check_interrupt()?;
        }

        let platform = Arc::clone(&self.platform);
        let routing = self.routing.clone();
        let interface = run_blocking(move || platform.request_interface(&routing))
            .await?
            .map_err(|e| {
                log::error!("Failed to establish the VPN: {}", e);
                StartAbort::Failed(ErrorKind::VpnStartFailure)
            })?;
        self.resources.interface = Some(interface.clone());
        self.check_interrupt()?;

        let engine = Arc::clone(&self.engine);
        let udp = options.enable_udp_forwarding;
        run_blocking(move || engine.connect(&client, &interface, udp))
            .await?
            .map_err(|e| {
                log::error!("Failed to connect the tunnel: {}", e);
                StartAbort::Failed(ErrorKind::VpnStartFailure)
            })?;
        self.resources.tunnel_connected = true;
        self.check_interrupt()?;

        Ok(())
    }

    async fn enter_foreground(&mut self) {
        let platform = Arc::clone(&self.platform);
        match run_blocking(move || platform.start_foreground()).await {
            Ok(Ok(())) => self.resources.foreground = true,
            Ok(Err(e)) => log::warn!("Unable to display persistent notification: {}", e),
            Err(_) => log::warn!("Unable to display persistent notification"),
        }
    }

    /// Release everything and return to idle, announcing `Stopped` unless
    /// there was nothing to stop.
    async fn teardown(&mut self) {
        if self.phase() == SessionPhase::Idle && self.resources.is_empty() {
            log::debug!("Stop requested while idle");
            return;
        }

        self.set_state(SessionPhase::Stopping, None);
        self.release().await;
        self.set_state(SessionPhase::Idle, None);
        log::info!("VPN stopped");
        self.emit(SessionEvent::Stopped);
    }

    async fn release(&mut self) {
        let resources = std::mem::take(&mut self.resources);
        if resources.is_empty() {
            return;
        }

        let engine = Arc::clone(&self.engine);
        let platform = Arc::clone(&self.platform);
        let result = tokio::task::spawn_blocking(move || {
            if resources.tunnel_connected {
                engine.disconnect();
            }
            if let Some(interface) = resources.interface {
                platform.release_interface(interface);
            }
            if resources.foreground {
                platform.stop_foreground();
            }
            drop(resources.client);
        })
        .await;

        if let Err(e) = result {
            log::error!("Session teardown panicked: {}", e);
        }
    }

    fn check_interrupt(&mut self) -> Result<(), StartAbort> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Reject(kind) => self.reject(kind),
                command => self.pending.push_back(command),
            }
        }
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(StartAbort::Interrupted)
        }
    }

    fn reject(&mut self, kind: ErrorKind) {
        if self.phase() == SessionPhase::Idle {
            self.set_state(SessionPhase::Idle, Some(kind));
        }
        self.emit(SessionEvent::Error(kind));
    }

    fn fail(&mut self, kind: ErrorKind) {
        self.set_state(SessionPhase::Idle, Some(kind));
        self.emit(SessionEvent::Error(kind));
    }

    fn phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    fn set_state(&self, phase: SessionPhase, last_error: Option<ErrorKind>) {
        log::debug!("Session phase -> {:?}", phase);
        self.state.send_replace(SessionState { phase, last_error });
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine; observers poll `state()` on attach.
        let _ = self.events.send(event);
    }
}

/// Run a blocking collaborator call off the async workers. A panic inside
/// the collaborator aborts the start as unexpected.
async fn run_blocking<T, F>(f: F) -> Result<T, StartAbort>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        log::error!("Collaborator call panicked: {}", e);
        StartAbort::Failed(ErrorKind::Unexpected)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::engine::EngineError;
    use crate::platform::PlatformError;

    struct FakeClient {
        live: Arc<AtomicUsize>,
    }

    impl Drop for FakeClient {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        reject_config: AtomicBool,
        connectivity_code: AtomicI64,
        fail_connect: AtomicBool,
        live: Arc<AtomicUsize>,
        max_live: AtomicUsize,
        probes: AtomicUsize,
        connected: AtomicBool,
        disconnects: AtomicUsize,
    }

    impl TunnelEngine for FakeEngine {
        type Client = FakeClient;

        fn build_client(&self, _descriptor: &ServerDescriptor) -> Result<FakeClient, EngineError> {
            if self.reject_config.load(Ordering::SeqCst) {
                return Err(EngineError::InvalidConfig("bad cipher".into()));
            }
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(FakeClient {
                live: Arc::clone(&self.live),
            })
        }

        fn check_connectivity(&self, _client: &FakeClient) -> Result<i64, EngineError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.connectivity_code.load(Ordering::SeqCst))
        }

        fn connect(
            &self,
            _client: &FakeClient,
            _interface: &InterfaceHandle,
            _enable_udp_forwarding: bool,
        ) -> Result<(), EngineError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(EngineError::Tunnel("tun2socks failed".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        deny: AtomicBool,
        open: Mutex<Vec<i32>>,
        next_fd: AtomicUsize,
        foreground: AtomicBool,
    }

    impl VpnPlatform for FakePlatform {
        fn request_interface(&self, routing: &RoutingRules) -> Result<InterfaceHandle, PlatformError> {
            assert_eq!(routing.session_name, "Outline");
            if self.deny.load(Ordering::SeqCst) {
                return Err(PlatformError::Denied);
            }
            let fd = 10 + self.next_fd.fetch_add(1, Ordering::SeqCst) as i32;
            self.open.lock().unwrap().push(fd);
            Ok(InterfaceHandle::new(fd))
        }

        fn release_interface(&self, interface: InterfaceHandle) {
            self.open.lock().unwrap().retain(|fd| *fd != interface.fd());
        }

        fn start_foreground(&self) -> Result<(), PlatformError> {
            self.foreground.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop_foreground(&self) {
            self.foreground.store(false, Ordering::SeqCst);
        }
    }

    fn descriptor(host: &str) -> ServerDescriptor {
        ServerDescriptor::new("chacha20-ietf-poly1305", "pw", host, 443).unwrap()
    }

    fn controller() -> (SessionController, Arc<FakeEngine>, Arc<FakePlatform>) {
        let engine = Arc::new(FakeEngine::default());
        let platform = Arc::new(FakePlatform::default());
        let controller = SessionController::new(
            Arc::clone(&engine),
            Arc::clone(&platform),
            RoutingRules::default(),
        );
        (controller, engine, platform)
    }

    async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    #[test]
    fn test_error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::Unexpected.code(), 1);
        assert_eq!(ErrorKind::UdpRelayNotEnabled.code(), 4);
        assert_eq!(ErrorKind::VpnStartFailure.code(), 6);
        assert_eq!(ErrorKind::ShadowsocksStartFailure.code(), 8);
        assert_eq!(ErrorKind::SystemMisconfigured.code(), 12);
    }

    #[test]
    fn test_from_probe_code_clamps_unknown_codes() {
        assert_eq!(ErrorKind::from_probe_code(0), None);
        assert_eq!(ErrorKind::from_probe_code(5), Some(ErrorKind::ServerUnreachable));
        assert_eq!(ErrorKind::from_probe_code(12), Some(ErrorKind::SystemMisconfigured));
        assert_eq!(ErrorKind::from_probe_code(13), Some(ErrorKind::Unexpected));
        assert_eq!(ErrorKind::from_probe_code(-1), Some(ErrorKind::Unexpected));
        assert_eq!(ErrorKind::from_probe_code(i64::MIN), Some(ErrorKind::Unexpected));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ServerUnreachable.to_string(), "SERVER_UNREACHABLE (5)");
        assert!(!ErrorKind::UdpRelayNotEnabled.is_fatal());
        assert!(ErrorKind::InvalidServerCredentials.is_fatal());
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (controller, engine, platform) = controller();
        let mut events = controller.subscribe();
        assert_eq!(controller.state(), SessionState::default());

        controller.start(descriptor("a.example"));
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        assert!(controller.is_connected());
        assert!(engine.connected.load(Ordering::SeqCst));
        assert!(platform.foreground.load(Ordering::SeqCst));
        assert_eq!(platform.open.lock().unwrap().len(), 1);

        controller.stop();
        assert_eq!(next_event(&mut events).await, SessionEvent::Stopped);
        assert!(!controller.is_connected());
        assert_eq!(controller.state().phase, SessionPhase::Idle);
        assert!(!engine.connected.load(Ordering::SeqCst));
        assert!(!platform.foreground.load(Ordering::SeqCst));
        assert!(platform.open.lock().unwrap().is_empty());
        assert_eq!(engine.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_udp_relay_not_enabled_still_connects() {
        let (controller, engine, _platform) = controller();
        engine.connectivity_code.store(ErrorKind::UdpRelayNotEnabled.code() as i64, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        assert!(controller.is_connected());
    }

    #[tokio::test]
    async fn test_probe_failure_aborts_to_idle() {
        let (controller, engine, platform) = controller();
        engine.connectivity_code.store(ErrorKind::InvalidServerCredentials.code() as i64, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::InvalidServerCredentials)
        );
        let state = controller.state();
        assert_eq!(state.phase, SessionPhase::Idle);
        assert_eq!(state.last_error, Some(ErrorKind::InvalidServerCredentials));
        assert!(platform.open.lock().unwrap().is_empty());
        assert_eq!(engine.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_probe_code_is_unexpected() {
        let (controller, engine, _platform) = controller();
        engine.connectivity_code.store(99, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::Unexpected)
        );
    }

    #[tokio::test]
    async fn test_extreme_connectivity_codes_do_not_stall_the_worker() {
        let (controller, engine, platform) = controller();
        let mut events = controller.subscribe();

        for code in [i64::MIN, i64::MAX, -1] {
            engine.connectivity_code.store(code, Ordering::SeqCst);
            controller.start(descriptor("a.example"));
            assert_eq!(
                next_event(&mut events).await,
                SessionEvent::Error(ErrorKind::Unexpected)
            );
            assert_eq!(controller.state().phase, SessionPhase::Idle);
        }
        assert!(platform.open.lock().unwrap().is_empty());

        engine.connectivity_code.store(0, Ordering::SeqCst);
        controller.start(descriptor("a.example"));
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
    }

    #[tokio::test]
    async fn test_client_construction_failure() {
        let (controller, engine, platform) = controller();
        engine.reject_config.store(true, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::ShadowsocksStartFailure)
        );
        assert_eq!(engine.probes.load(Ordering::SeqCst), 0);
        assert!(platform.open.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interface_denied_is_vpn_start_failure() {
        let (controller, engine, platform) = controller();
        platform.deny.store(true, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::VpnStartFailure)
        );
        assert_eq!(engine.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_interface() {
        let (controller, engine, platform) = controller();
        engine.fail_connect.store(true, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::VpnStartFailure)
        );
        assert!(platform.open.lock().unwrap().is_empty());
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_auto_reconnect_skips_probe() {
        let (controller, engine, _platform) = controller();
        engine.connectivity_code.store(ErrorKind::ServerUnreachable.code() as i64, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller.start_with(descriptor("a.example"), SessionOptions::auto_reconnect());
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        assert_eq!(engine.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_start_replaces_first() {
        let (controller, engine, platform) = controller();
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        controller.start(descriptor("b.example"));

        let mut started = 0;
        loop {
            match next_event(&mut events).await {
                SessionEvent::Started => {
                    started += 1;
                    if controller.state().phase == SessionPhase::Connected {
                        break;
                    }
                }
                SessionEvent::Stopped => {}
                SessionEvent::Error(kind) => panic!("unexpected error {}", kind),
            }
        }
        // Drain anything left from a superseded start.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            if event == SessionEvent::Started {
                started += 1;
            }
        }

        assert!(started >= 1);
        assert!(controller.is_connected());
        assert_eq!(engine.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(engine.live.load(Ordering::SeqCst), 1);
        assert_eq!(platform.open.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (controller, engine, _platform) = controller();
        let mut events = controller.subscribe();

        controller.stop();
        controller.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(controller.state(), SessionState::default());

        controller.start(descriptor("a.example"));
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        controller.stop();
        controller.stop();
        assert_eq!(next_event(&mut events).await, SessionEvent::Stopped);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(engine.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_while_starting_ends_idle() {
        let (controller, engine, platform) = controller();
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        controller.stop();

        // Either the start was interrupted or it finished before the stop
        // was seen; both end idle with one Stopped.
        loop {
            if next_event(&mut events).await == SessionEvent::Stopped {
                break;
            }
        }
        assert_eq!(controller.state().phase, SessionPhase::Idle);
        assert_eq!(engine.live.load(Ordering::SeqCst), 0);
        assert!(platform.open.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_start_without_descriptor() {
        let (controller, _engine, _platform) = controller();
        let mut events = controller.subscribe();

        controller.dispatch(ServiceAction::Start, None);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::Unexpected)
        );

        controller.dispatch(ServiceAction::Start, Some(descriptor("a.example")));
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        controller.dispatch(ServiceAction::Stop, None);
        assert_eq!(next_event(&mut events).await, SessionEvent::Stopped);
    }

    #[tokio::test]
    async fn test_reject_reports_without_touching_session() {
        let (controller, engine, _platform) = controller();
        let mut events = controller.subscribe();

        controller.reject(ErrorKind::IllegalServerConfiguration);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error(ErrorKind::IllegalServerConfiguration)
        );
        assert_eq!(
            controller.state().last_error,
            Some(ErrorKind::IllegalServerConfiguration)
        );

        controller.start(descriptor("a.example"));
        controller.reject(ErrorKind::IllegalServerConfiguration);
        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.push(next_event(&mut events).await);
        }
        assert!(seen.contains(&SessionEvent::Started));
        assert!(seen.contains(&SessionEvent::Error(ErrorKind::IllegalServerConfiguration)));
        assert!(controller.is_connected());
        assert_eq!(engine.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_session() {
        let (controller, engine, platform) = controller();
        let mut events = controller.subscribe();

        controller.start(descriptor("a.example"));
        assert_eq!(next_event(&mut events).await, SessionEvent::Started);

        controller.shutdown();
        assert_eq!(next_event(&mut events).await, SessionEvent::Stopped);
        assert_eq!(engine.live.load(Ordering::SeqCst), 0);
        assert!(platform.open.lock().unwrap().is_empty());

        // Worker is gone; further commands are dropped.
        controller.start(descriptor("b.example"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!controller.is_connected());
    }
}

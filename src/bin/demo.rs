//! Demo binary
//!
//! Walks through access-key handling and a VPN session lifecycle against a
//! simulated tunnel engine and platform, without a real VPN service.
//! Access keys given on the command line are parsed in addition to the
//! built-in samples (`ssconf://` keys are fetched over the network).

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outline_core::codec;
use outline_core::config::{CoreConfig, RoutingRules, SessionOptions};
use outline_core::descriptor::ServerDescriptor;
use outline_core::engine::{EngineError, TunnelEngine};
use outline_core::platform::{InterfaceHandle, PlatformError, VpnPlatform};
use outline_core::servers::{ServerEntry, ServerList};
use outline_core::session::{ErrorKind, SessionController, SessionEvent};
use outline_core::validator;
use outline_core::OutlineCore;

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== Outline Core Demo ===\n");

    let core = match OutlineCore::new(CoreConfig::default()) {
        Ok(core) => core,
        Err(e) => {
            eprintln!("Failed to create core: {}", e);
            return;
        }
    };

    let mut keys = sample_keys();
    keys.extend(std::env::args().skip(1));

    // Demo 1: Validation
    demo_validation(&keys);

    // Demo 2: Parsing
    let servers = demo_parsing(&core, &keys).await;

    // Demo 3: Session lifecycle
    demo_session(&core, &servers).await;

    println!("\n=== Demo Complete ===");
}

fn sample_keys() -> Vec<String> {
    let descriptor = ServerDescriptor::new("chacha20-ietf-poly1305", "s3cr3t", "203.0.113.7", 443)
        .map(|d| d.with_prefix(vec![0x16u8, 0x03, 0x01]));
    let mut keys = vec![
        format!(
            "ss://{}@198.51.100.2:8388#Tokyo",
            codec::encode_base64(b"aes-256-gcm:hunter2")
        ),
        format!(
            "ss://{}#Legacy",
            codec::encode_base64(b"aes-128-gcm:pw@198.51.100.5:9000")
        ),
        "ss://not-a-key".to_string(),
        "https://example.com".to_string(),
    ];
    if let Ok(descriptor) = descriptor {
        keys.push(descriptor.to_uri());
    }
    keys
}

fn demo_validation(keys: &[String]) {
    println!("--- Demo 1: Validation ---");
    for key in keys {
        let result = validator::check(key);
        match result.reason {
            None => println!("  valid    {}", key),
            Some(reason) => println!("  invalid  {} ({})", key, reason),
        }
    }
    println!();
}

async fn demo_parsing<F>(core: &OutlineCore<F>, keys: &[String]) -> ServerList
where
    F: outline_core::RemoteFetcher,
{
    println!("--- Demo 2: Parsing ---");
    let mut servers = ServerList::new();
    for key in keys {
        match core.parse(key).await {
            Ok(descriptor) => {
                println!("  {:?}", descriptor);
                if let Err(e) = servers.add(ServerEntry::from_uri(key.as_str())) {
                    println!("  not saved: {}", e);
                }
            }
            Err(e) => println!("  {} -> {}", key, e),
        }
    }
    for entry in servers.iter() {
        println!("  saved: {}", entry.display_name());
    }
    println!();
    servers
}

async fn demo_session<F>(core: &OutlineCore<F>, servers: &ServerList)
where
    F: outline_core::RemoteFetcher,
{
    println!("--- Demo 3: Session Lifecycle ---");

    let engine = Arc::new(SimulatedEngine::default());
    let platform = Arc::new(SimulatedPlatform::default());
    let session = core.session(Arc::clone(&engine), Arc::clone(&platform));
    let mut events = session.subscribe();

    for entry in servers.iter() {
        println!("  connecting to {}", entry.display_name());
        if let Err(e) = core.connect(&session, &entry.uri).await {
            println!("  {}", e);
            continue;
        }
        report(&session, &mut events).await;
    }

    println!("  server without UDP relay");
    engine
        .probe_code
        .store(ErrorKind::UdpRelayNotEnabled.code(), Ordering::SeqCst);
    if let Some(entry) = servers.get(0) {
        if let Ok(descriptor) = core.parse(&entry.uri).await {
            session.start(descriptor);
            report(&session, &mut events).await;
        }
    }

    println!("  unreachable server, reconnect after reboot");
    engine
        .probe_code
        .store(ErrorKind::ServerUnreachable.code(), Ordering::SeqCst);
    if let Some(entry) = servers.get(0) {
        if let Ok(descriptor) = core.parse(&entry.uri).await {
            session.start(descriptor.clone());
            report(&session, &mut events).await;
            session.start_with(descriptor, SessionOptions::auto_reconnect());
            report(&session, &mut events).await;
        }
    }

    println!("  permission revoked by the platform");
    session.on_revoke();
    report(&session, &mut events).await;

    session.shutdown();
    println!();
}

async fn report(
    session: &SessionController,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(SessionEvent::Stopped)) if session.state().phase != outline_core::SessionPhase::Idle => {
                println!("    event: Stopped (previous session)");
            }
            Ok(Ok(event)) => {
                println!("    event: {:?}, state: {:?}", event, session.state());
                return;
            }
            Ok(Err(e)) => {
                println!("    event channel: {}", e);
                return;
            }
            Err(_) => {
                println!("    no event, state: {:?}", session.state());
                return;
            }
        }
    }
}

#[derive(Default)]
struct SimulatedEngine {
    probe_code: AtomicI32,
    connected: AtomicBool,
}

impl TunnelEngine for SimulatedEngine {
    type Client = String;

    fn build_client(&self, descriptor: &ServerDescriptor) -> Result<String, EngineError> {
        if descriptor.method().is_empty() {
            return Err(EngineError::InvalidConfig("missing cipher".into()));
        }
        Ok(descriptor.server_address())
    }

    fn check_connectivity(&self, client: &String) -> Result<i64, EngineError> {
        std::thread::sleep(Duration::from_millis(50));
        log::info!("Probing {}", client);
        Ok(self.probe_code.load(Ordering::SeqCst) as i64)
    }

    fn connect(
        &self,
        client: &String,
        interface: &InterfaceHandle,
        enable_udp_forwarding: bool,
    ) -> Result<(), EngineError> {
        log::info!(
            "Forwarding tun fd {} to {} (udp: {})",
            interface.fd(),
            client,
            enable_udp_forwarding
        );
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SimulatedPlatform {
    next_fd: AtomicI32,
}

impl VpnPlatform for SimulatedPlatform {
    fn request_interface(&self, routing: &RoutingRules) -> Result<InterfaceHandle, PlatformError> {
        log::info!(
            "Interface {}/{} mtu {} dns {:?}",
            routing.address,
            routing.prefix_len,
            routing.mtu,
            routing.dns_servers
        );
        Ok(InterfaceHandle::new(100 + self.next_fd.fetch_add(1, Ordering::SeqCst)))
    }

    fn release_interface(&self, interface: InterfaceHandle) {
        log::info!("Closing tun fd {}", interface.fd());
    }

    fn start_foreground(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn stop_foreground(&self) {}
}

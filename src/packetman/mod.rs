//! SYN-ACK packet transformer.
//!
//! Locally originated SYN-ACK packets whose source port is one of the
//! configured protocol ports are diverted into a netfilter queue. For each
//! intercepted packet a caller-supplied selector names a transformation
//! spec; the original packet is then either released unchanged or dropped
//! and replaced by one or more transformed packets injected through raw
//! sockets. Which spec was applied is recorded per 4-tuple so the listener
//! accepting the TCP connection can attribute it.
//!
//! Failure policy is fail open throughout the data plane: any parse or
//! policy error releases the original packet unchanged, because an
//! incorrect verdict here breaks every TCP connection on the port.

pub mod cache;
pub mod inject;
pub mod intercept;
pub mod netconfig;
pub mod spec;
pub mod transform;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use cache::{AppliedSpec, AppliedSpecCache, ConnectionFingerprint, SelectExtra};
use inject::{PacketInjector, DEFAULT_SOCKET_MARK};
use intercept::{
    platform_provider, InterceptConfig, InterceptHandle, InterceptProvider, InterceptedPacket,
    PacketVerdict,
};
use spec::{compile_specs, CompiledSpec, Spec};

/// Default lifetime of an unconsumed applied-spec record; generously above
/// the time a TCP handshake may reasonably take to complete.
pub const APPLIED_SPEC_TTL: Duration = Duration::from_secs(60);

/// Selects the spec to apply to an intercepted SYN-ACK, given the protocol
/// port and the client IP. An empty name means "no transform". The second
/// value is opaque caller data returned by `get_applied_spec`. May be
/// non-deterministic.
pub type SpecSelector = dyn Fn(u16, IpAddr) -> (String, SelectExtra) + Send + Sync;

type InjectorFactory =
    Box<dyn Fn(u32, bool) -> std::io::Result<Arc<dyn PacketInjector>> + Send + Sync>;

pub struct ManipulatorConfig {
    /// TCP source ports whose SYN-ACKs are intercepted. Empty means there
    /// is nothing to run; start() succeeds as a no-op.
    pub protocol_ports: Vec<u16>,
    pub queue_number: u16,
    /// Socket mark for injected packets; 0 selects the default ("PSIP").
    pub socket_mark: u32,
    /// Downgrade missing IPv6 support (raw socket or ip6tables) to a
    /// warning instead of failing start().
    pub allow_no_ipv6_network_configuration: bool,
    pub sudo_network_config_commands: bool,
    pub specs: Vec<Spec>,
    pub select_spec: Arc<SpecSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Lifecycle {
    state: RunState,
    handle: Option<Box<dyn InterceptHandle>>,
}

struct Shared {
    registry: Mutex<HashMap<String, Arc<CompiledSpec>>>,
    cache: AppliedSpecCache,
    select_spec: Arc<SpecSelector>,
}

pub struct Manipulator {
    config: ManipulatorConfig,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    provider: Box<dyn InterceptProvider>,
    injector_factory: InjectorFactory,
}

fn default_injector_factory() -> InjectorFactory {
    Box::new(|_socket_mark, _allow_no_ipv6| {
        #[cfg(target_os = "linux")]
        {
            let injector = inject::RawSocketInjector::open(_socket_mark, _allow_no_ipv6)?;
            Ok(Arc::new(injector) as Arc<dyn PacketInjector>)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "raw packet injection is not supported on this platform",
            ))
        }
    })
}

impl Manipulator {
    pub fn new(config: ManipulatorConfig) -> std::io::Result<Self> {
        Self::with_providers(config, platform_provider(), default_injector_factory())
    }

    /// Construct with explicit providers; used by tests to run the full
    /// data plane without kernel resources.
    pub fn with_providers(
        config: ManipulatorConfig,
        provider: Box<dyn InterceptProvider>,
        injector_factory: InjectorFactory,
    ) -> std::io::Result<Self> {
        let registry = compile_specs(&config.specs)?;
        let shared = Arc::new(Shared {
            registry: Mutex::new(registry),
            cache: AppliedSpecCache::new(APPLIED_SPEC_TTL),
            select_spec: config.select_spec.clone(),
        });
        Ok(Self {
            config,
            shared,
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::Idle,
                handle: None,
            }),
            running: AtomicBool::new(false),
            provider,
            injector_factory,
        })
    }

    fn socket_mark(&self) -> u32 {
        if self.config.socket_mark == 0 {
            DEFAULT_SOCKET_MARK
        } else {
            self.config.socket_mark
        }
    }

    /// Acquire intercept and raw-socket resources. Once start() returns,
    /// SYN-ACK packets on all configured ports are being intercepted. On
    /// failure all partial initialization is rolled back; a subsequent
    /// stop() is then a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != RunState::Idle {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "already running",
            ));
        }

        if self.config.protocol_ports.is_empty() {
            // Nothing to intercept; success, and stop() remains a no-op.
            return Ok(());
        }

        lifecycle.state = RunState::Starting;

        // A failed start leaves via STOPPING, the same path a running
        // manipulator takes, so rollback is uniform.
        let fail_start = |lifecycle: &mut Lifecycle, e: std::io::Error| -> std::io::Error {
            lifecycle.state = RunState::Stopping;
            if let Some(mut handle) = lifecycle.handle.take() {
                if let Err(close_err) = handle.close() {
                    log::warn!("close intercept queue failed: {}", close_err);
                }
            }
            lifecycle.state = RunState::Idle;
            e
        };

        let injector = match (self.injector_factory)(
            self.socket_mark(),
            self.config.allow_no_ipv6_network_configuration,
        ) {
            Ok(injector) => injector,
            Err(e) => {
                return Err(fail_start(
                    &mut lifecycle,
                    std::io::Error::new(e.kind(), format!("open raw sockets: {}", e)),
                ));
            }
        };

        let intercept_config = self.intercept_config();
        let shared = self.shared.clone();
        let callback = Box::new(move |packet: InterceptedPacket| {
            handle_intercepted_packet(&shared, injector.as_ref(), &packet)
        });

        let handle = match self.provider.open(&intercept_config, callback) {
            Ok(handle) => handle,
            Err(e) => {
                return Err(fail_start(
                    &mut lifecycle,
                    std::io::Error::new(e.kind(), format!("open intercept queue: {}", e)),
                ));
            }
        };

        lifecycle.handle = Some(handle);
        lifecycle.state = RunState::Running;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Halt interception, release resources, and restore network state.
    /// Safe to call after a failed start().
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != RunState::Running {
            return;
        }
        lifecycle.state = RunState::Stopping;
        self.running.store(false, Ordering::Release);

        if let Some(mut handle) = lifecycle.handle.take() {
            if let Err(e) = handle.close() {
                log::warn!("close intercept queue failed: {}", e);
            }
        }

        lifecycle.state = RunState::Idle;
    }

    /// Atomically replace the spec registry. On error the previous registry
    /// is retained. Legal only while running.
    pub fn set_specs(&self, specs: &[Spec]) -> std::io::Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not running",
            ));
        }
        let compiled = compile_specs(specs)?;
        *self.shared.registry.lock() = compiled;
        Ok(())
    }

    /// Return and consume the spec record for the TCP connection with the
    /// given local and peer addresses. The peer address must be the true
    /// immediate network peer, not a proxy-preserved client address.
    pub fn get_applied_spec(
        &self,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> std::io::Result<(String, SelectExtra)> {
        if !self.running.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not running",
            ));
        }
        let fingerprint = ConnectionFingerprint::from_addrs(local_addr, peer_addr);
        match self.shared.cache.consume(&fingerprint) {
            Some(applied) => Ok((applied.spec_name, applied.extra)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "connection not found",
            )),
        }
    }

    fn intercept_config(&self) -> InterceptConfig {
        InterceptConfig {
            queue_number: self.config.queue_number,
            ports: self.config.protocol_ports.clone(),
            socket_mark: self.socket_mark(),
            allow_no_ipv6: self.config.allow_no_ipv6_network_configuration,
            use_sudo: self.config.sudo_network_config_commands,
            ..InterceptConfig::default()
        }
    }
}

impl Drop for Manipulator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-packet data plane. Returns the verdict for the intercepted packet;
/// any failure before the spec is applied fails open.
fn handle_intercepted_packet(
    shared: &Shared,
    injector: &dyn PacketInjector,
    packet: &InterceptedPacket,
) -> PacketVerdict {
    let parsed = match transform::parse_syn_ack(&packet.data) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("unexpected packet: {}", e);
            return PacketVerdict::Accept;
        }
    };

    // In the SYN-ACK direction the source is the server and the
    // destination is the client.
    let client_ip = parsed.destination_ip();
    let (spec_name, extra) = (shared.select_spec)(parsed.source_port(), client_ip);

    let fingerprint = ConnectionFingerprint::new(
        parsed.source_ip(),
        parsed.source_port(),
        client_ip,
        parsed.destination_port(),
    );

    if spec_name.is_empty() {
        // No transform; record the empty selection so the accept path can
        // still attribute the connection.
        shared.cache.insert(
            fingerprint,
            AppliedSpec {
                spec_name,
                extra,
            },
        );
        return PacketVerdict::Accept;
    }

    let compiled = shared.registry.lock().get(&spec_name).cloned();
    let compiled = match compiled {
        Some(compiled) => compiled,
        None => {
            log::warn!("invalid spec name: {}", spec_name);
            return PacketVerdict::Accept;
        }
    };

    // Record before issuing any verdict or injecting: the TCP handshake
    // may complete and get_applied_spec run on another thread before this
    // function returns.
    shared.cache.insert(
        fingerprint,
        AppliedSpec {
            spec_name,
            extra,
        },
    );

    match transform::apply_spec(&compiled, &parsed) {
        Ok(packets) => {
            let mut send_error = None;
            for transformed in &packets {
                // Per-packet errors; remaining packets in the burst are
                // still attempted.
                if let Err(e) = injector.inject(client_ip, transformed) {
                    send_error = Some(e);
                }
            }
            if let Some(e) = send_error {
                log::warn!("inject packets failed: {}", e);
            }
        }
        Err(e) => {
            log::warn!("apply spec failed: {}", e);
        }
    }

    PacketVerdict::Drop
}

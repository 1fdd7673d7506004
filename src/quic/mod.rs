//! Obfuscated QUIC transport.
//!
//! A listener and dialer whose datagrams are wrapped by a keyed
//! obfuscation layer, with first-packet proof of key knowledge as the
//! anti-probing defense: a peer that cannot produce the proof receives no
//! bytes from the server, not even version negotiation. Two QUIC dialects
//! (modern and a legacy-tagged variant) can share one listening socket
//! through an internal mux.

pub mod conn;
pub mod crypto_config;
pub mod mux;
pub mod obfuscator;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Runtime;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::{mpsc, watch};

pub use conn::ObfuscatedQuicConn;
pub use obfuscator::{Dialect, MAX_PACKET_SIZE_ADJUSTMENT};

use obfuscator::{ObfuscatedUdpSocket, LEGACY_VERSION_NUMBER, MODERN_VERSION_NUMBER};
use crate::passthrough::make_passthrough_message;
use crate::socket_util::new_udp_socket;

pub const SERVER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// MTU reported to quinn so encoded datagrams still fit 1280 bytes.
const OBFUSCATED_MTU: u16 = 1280 - MAX_PACKET_SIZE_ADJUSTMENT as u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    /// Modern dialect under the obfuscation layer.
    Obfuscated,
    /// Modern dialect with a random decoy preamble before the Initial.
    ObfuscatedDecoy,
    /// Legacy-tagged dialect. No first-packet proof is possible on this
    /// dialect; dialing it assumes the server has it enabled.
    Legacy,
}

impl QuicVersion {
    fn version_number(self) -> u32 {
        match self {
            QuicVersion::Obfuscated | QuicVersion::ObfuscatedDecoy => MODERN_VERSION_NUMBER,
            QuicVersion::Legacy => LEGACY_VERSION_NUMBER,
        }
    }

    fn dialect(self) -> Dialect {
        match self {
            QuicVersion::Obfuscated | QuicVersion::ObfuscatedDecoy => Dialect::Modern,
            QuicVersion::Legacy => Dialect::Legacy,
        }
    }

    fn is_decoy(self) -> bool {
        matches!(self, QuicVersion::ObfuscatedDecoy)
    }
}

fn transport_config(idle_timeout: Duration, is_server: bool) -> io::Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(1u32.into())
        .max_concurrent_uni_streams(0u8.into())
        .max_idle_timeout(Some(idle_timeout.try_into().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "idle timeout out of range")
        })?))
        .initial_mtu(OBFUSCATED_MTU)
        .min_mtu(OBFUSCATED_MTU)
        // Path MTU discovery would probe past the space reserved for the
        // obfuscation overhead; the MTU is fixed instead.
        .mtu_discovery_config(None);
    if !is_server {
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    }
    Ok(transport)
}

fn endpoint_config(version_number: u32) -> quinn::EndpointConfig {
    let mut config = quinn::EndpointConfig::default();
    config.supported_versions(vec![version_number]);
    config
}

pub struct QuicListenConfig {
    pub bind_address: SocketAddr,
    pub obfuscation_key: String,
    /// Run the mux and accept the legacy dialect alongside the modern one.
    /// The legacy stack answers probes, so enabling this forfeits the
    /// anti-probing guarantee on that dialect.
    pub enable_legacy_dialect: bool,
    /// Server idle timeout; a per-listener setting so tests can shorten it.
    pub idle_timeout: Duration,
}

impl QuicListenConfig {
    pub fn new(bind_address: SocketAddr, obfuscation_key: String) -> Self {
        Self {
            bind_address,
            obfuscation_key,
            enable_legacy_dialect: false,
            idle_timeout: SERVER_IDLE_TIMEOUT,
        }
    }
}

pub struct QuicListener {
    local_addr: SocketAddr,
    accepted_rx: mpsc::Receiver<ObfuscatedQuicConn>,
    endpoints: Vec<quinn::Endpoint>,
    stop_tx: watch::Sender<bool>,
}

impl QuicListener {
    /// Bind the UDP socket and start the dialect stacks.
    pub fn listen(config: QuicListenConfig) -> io::Result<Self> {
        let std_socket = new_udp_socket(config.bind_address)?;
        let local_addr = std_socket.local_addr()?;

        let runtime = Arc::new(quinn::TokioRuntime);
        let inner = runtime.wrap_udp_socket(std_socket)?;
        let socket = Arc::new(ObfuscatedUdpSocket::new_server(
            inner,
            &config.obfuscation_key,
            config.enable_legacy_dialect,
        )?);

        let server_crypto = crypto_config::new_server_config()?;
        let quic_server_config: quinn::crypto::rustls::QuicServerConfig = server_crypto
            .try_into()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("quic tls config: {}", e)))?;
        let quic_server_config = Arc::new(quic_server_config);

        let make_server_config = |_: Dialect| -> io::Result<quinn::ServerConfig> {
            let mut server_config =
                quinn::ServerConfig::with_crypto(quic_server_config.clone());
            server_config.transport_config(Arc::new(transport_config(
                config.idle_timeout,
                true,
            )?));
            Ok(server_config)
        };

        // One accepted-session funnel for all dialect stacks.
        let (accepted_tx, accepted_rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut endpoints = Vec::new();

        if config.enable_legacy_dialect {
            log::warn!(
                "legacy QUIC dialect enabled; anti-probing is not guaranteed on that dialect"
            );

            let queues = mux::new_mux_queues(local_addr, socket.clone());
            let (modern_conn, legacy_conn, channels) = queues.into_relay_parts();

            let modern = quinn::Endpoint::new_with_abstract_socket(
                endpoint_config(MODERN_VERSION_NUMBER),
                Some(make_server_config(Dialect::Modern)?),
                Arc::new(modern_conn),
                runtime.clone(),
            )?;
            let legacy = quinn::Endpoint::new_with_abstract_socket(
                endpoint_config(LEGACY_VERSION_NUMBER),
                Some(make_server_config(Dialect::Legacy)?),
                Arc::new(legacy_conn),
                runtime.clone(),
            )?;

            tokio::spawn(mux::relay_packets(
                socket.clone(),
                channels,
                stop_rx.clone(),
            ));
            tokio::spawn(relay_accepted_sessions(
                modern.clone(),
                Dialect::Modern,
                accepted_tx.clone(),
                stop_rx.clone(),
            ));
            tokio::spawn(relay_accepted_sessions(
                legacy.clone(),
                Dialect::Legacy,
                accepted_tx,
                stop_rx,
            ));

            endpoints.push(modern);
            endpoints.push(legacy);
        } else {
            // Single-dialect mode: the modern stack reads the obfuscated
            // socket directly, skipping the mux queues and preserving the
            // socket's receive metadata (ECN).
            let endpoint = quinn::Endpoint::new_with_abstract_socket(
                endpoint_config(MODERN_VERSION_NUMBER),
                Some(make_server_config(Dialect::Modern)?),
                socket.clone(),
                runtime,
            )?;

            tokio::spawn(relay_accepted_sessions(
                endpoint.clone(),
                Dialect::Modern,
                accepted_tx,
                stop_rx,
            ));
            endpoints.push(endpoint);
        }

        Ok(Self {
            local_addr,
            accepted_rx,
            endpoints,
            stop_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next session from either dialect stack. The returned
    /// conn performs its stream accept on first I/O. Errors only when the
    /// listener has been closed.
    pub async fn accept(&mut self) -> io::Result<ObfuscatedQuicConn> {
        match self.accepted_rx.recv().await {
            Some(conn) => Ok(conn),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener closed",
            )),
        }
    }

    /// Stop the relay tasks and close all dialect endpoints; the socket is
    /// released when the last endpoint reference drops.
    pub fn close(&mut self) {
        let _ = self.stop_tx.send(true);
        for endpoint in &self.endpoints {
            endpoint.close(0u32.into(), b"");
        }
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn relay_accepted_sessions(
    endpoint: quinn::Endpoint,
    dialect: Dialect,
    accepted_tx: mpsc::Sender<ObfuscatedQuicConn>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let incoming = tokio::select! {
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => return,
            },
            _ = stop.changed() => return,
        };

        // Handshakes complete in spawned tasks so one slow peer cannot
        // stall the accept loop.
        let accepted_tx = accepted_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(SERVER_HANDSHAKE_TIMEOUT, incoming).await {
                Ok(Ok(connection)) => {
                    let _ = accepted_tx
                        .send(ObfuscatedQuicConn::new_deferred(connection, dialect))
                        .await;
                }
                Ok(Err(e)) => {
                    log::debug!("session handshake failed: {}", e);
                }
                Err(_) => {
                    log::debug!("session handshake timed out");
                }
            }
        });
    }
}

pub struct QuicDialConfig {
    pub remote_addr: SocketAddr,
    /// SNI for the QUIC TLS layer; when empty the remote IP string is
    /// used.
    pub server_name: String,
    pub version: QuicVersion,
    pub obfuscation_key: String,
    /// Seeds the first-flight padding (and decoy schedule), making a dial
    /// byte-replayable.
    pub obfuscation_padding_seed: Option<[u8; 32]>,
    /// Bounds the QUIC handshake; the packet socket is closed when it
    /// fires or when the returned future is dropped.
    pub handshake_timeout: Option<Duration>,
}

impl QuicDialConfig {
    pub fn new(
        remote_addr: SocketAddr,
        version: QuicVersion,
        obfuscation_key: String,
        obfuscation_padding_seed: [u8; 32],
    ) -> Self {
        Self {
            remote_addr,
            server_name: String::new(),
            version,
            obfuscation_key,
            obfuscation_padding_seed: Some(obfuscation_padding_seed),
            handshake_timeout: None,
        }
    }
}

/// Establish a new QUIC session and stream.
///
/// Parameter validation is strict: the obfuscation key and padding seed
/// are always required, as the key also drives the anti-probing proof.
/// Dropping the returned future cancels the dial and releases the socket.
pub async fn dial(config: QuicDialConfig) -> io::Result<ObfuscatedQuicConn> {
    if config.obfuscation_key.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "missing obfuscation values",
        ));
    }
    let padding_seed = config.obfuscation_padding_seed.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "missing obfuscation values")
    })?;
    // The stack times out slowly on port 0 instead of failing; reject it
    // up front.
    if config.remote_addr.port() == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid destination port",
        ));
    }

    let bind_address: SocketAddr = if config.remote_addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let std_socket = new_udp_socket(bind_address)?;

    let runtime = Arc::new(quinn::TokioRuntime);
    let inner = runtime.wrap_udp_socket(std_socket)?;

    let passthrough = make_passthrough_message(&config.obfuscation_key)?;
    let socket = Arc::new(ObfuscatedUdpSocket::new_client(
        inner,
        &config.obfuscation_key,
        padding_seed,
        passthrough,
    )?);

    if config.version.is_decoy() {
        send_decoy_preamble(&socket, config.remote_addr, padding_seed).await;
    }

    let mut endpoint = quinn::Endpoint::new_with_abstract_socket(
        endpoint_config(config.version.version_number()),
        None,
        socket.clone(),
        runtime,
    )?;
    endpoint.set_default_client_config(make_client_config(config.version)?);

    let server_name = if config.server_name.is_empty() {
        config.remote_addr.ip().to_string()
    } else {
        config.server_name.clone()
    };

    let connecting = endpoint
        .connect(config.remote_addr, &server_name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("connect: {}", e)))?;

    let connection = match config.handshake_timeout {
        Some(limit) => match tokio::time::timeout(limit, connecting).await {
            Ok(result) => result,
            Err(_) => {
                endpoint.close(0u32.into(), b"");
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "QUIC handshake timed out",
                ));
            }
        },
        None => connecting.await,
    }
    .map_err(|e| {
        endpoint.close(0u32.into(), b"");
        io::Error::new(io::ErrorKind::ConnectionRefused, format!("handshake: {}", e))
    })?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("open stream: {}", e)))?;

    Ok(ObfuscatedQuicConn::new_client(
        connection,
        endpoint,
        send,
        recv,
        config.version.dialect(),
    ))
}

fn make_client_config(version: QuicVersion) -> io::Result<quinn::ClientConfig> {
    let crypto = crypto_config::new_insecure_client_config();
    let quic_client_config = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("quic tls config: {}", e)))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));
    client_config.transport_config(Arc::new(transport_config(CLIENT_IDLE_TIMEOUT, false)?));
    client_config.version(version.version_number());
    Ok(client_config)
}

/// Emit the decoy preamble: a seeded-random number of pure-random
/// datagrams. They never decode on the server and draw no response or
/// penalty.
async fn send_decoy_preamble(
    socket: &ObfuscatedUdpSocket,
    remote_addr: SocketAddr,
    padding_seed: [u8; 32],
) {
    let mut seed = padding_seed;
    // Separate stream from the padding PRNG.
    seed[0] ^= 0xd5;
    let mut rng = StdRng::from_seed(seed);

    let count = rng.gen_range(0..=2);
    for _ in 0..count {
        let len = rng.gen_range(320..=1350);
        let mut datagram = vec![0u8; len];
        rng.fill_bytes(&mut datagram);
        if let Err(e) = socket.send_plain(remote_addr, &datagram).await {
            log::debug!("decoy send failed: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_validation() {
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();

        // Missing key.
        let mut config = QuicDialConfig::new(addr, QuicVersion::Obfuscated, String::new(), [0u8; 32]);
        let err = dial(config).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Missing padding seed.
        config = QuicDialConfig::new(addr, QuicVersion::Obfuscated, "key".to_string(), [0u8; 32]);
        config.obfuscation_padding_seed = None;
        let err = dial(config).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Invalid destination port.
        let bad_port: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config =
            QuicDialConfig::new(bad_port, QuicVersion::Obfuscated, "key".to_string(), [0u8; 32]);
        let err = dial(config).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_listener_binds_and_closes() {
        let config = QuicListenConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "listen-test-key".to_string(),
        );
        let mut listener = QuicListener::listen(config).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        listener.close();
        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_probe_receives_no_response() {
        let config = QuicListenConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "probe-test-key".to_string(),
        );
        let listener = QuicListener::listen(config).unwrap();
        let target = listener.local_addr();

        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0u8; 1200];
        rand::thread_rng().fill_bytes(&mut datagram);
        probe.send_to(&datagram, target).await.unwrap();

        let mut buffer = [0u8; 2048];
        let response = tokio::time::timeout(
            Duration::from_secs(2),
            probe.recv_from(&mut buffer),
        )
        .await;
        // No version negotiation, no error, nothing.
        assert!(response.is_err(), "server responded to a probe");
    }

    #[tokio::test]
    async fn test_obfuscated_dial_and_echo() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let key = "loopback-test-key".to_string();
        let mut listen_config =
            QuicListenConfig::new("127.0.0.1:0".parse().unwrap(), key.clone());
        listen_config.idle_timeout = Duration::from_secs(20);
        let mut listener = QuicListener::listen(listen_config).unwrap();
        let target = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            // Deferred stream accept: the first read performs it.
            let mut buffer = [0u8; 4];
            conn.read_exact(&mut buffer).await.unwrap();
            conn.write_all(&buffer).await.unwrap();
            conn.flush().await.unwrap();
            // Hold the conn open until the client is done with it.
            tokio::time::sleep(Duration::from_millis(500)).await;
            (listener, conn)
        });

        let mut dial_config = QuicDialConfig::new(
            target,
            QuicVersion::Obfuscated,
            key,
            [0x21u8; 32],
        );
        dial_config.handshake_timeout = Some(Duration::from_secs(10));

        let mut conn = tokio::time::timeout(Duration::from_secs(15), dial(dial_config))
            .await
            .expect("dial timed out")
            .unwrap();
        assert_eq!(conn.dialect(), Dialect::Modern);

        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();

        let mut echoed = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&echoed, b"ping");

        conn.close();
        let (_listener, _server_conn) = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_decoy_dial_succeeds() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let key = "decoy-test-key".to_string();
        let mut listener = QuicListener::listen(QuicListenConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            key.clone(),
        ))
        .unwrap();
        let target = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buffer = [0u8; 1];
            conn.read_exact(&mut buffer).await.unwrap();
            conn.write_all(&buffer).await.unwrap();
            conn.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            (listener, conn)
        });

        let mut dial_config = QuicDialConfig::new(
            target,
            QuicVersion::ObfuscatedDecoy,
            key,
            [0x7fu8; 32],
        );
        dial_config.handshake_timeout = Some(Duration::from_secs(10));

        let mut conn = tokio::time::timeout(Duration::from_secs(15), dial(dial_config))
            .await
            .expect("dial timed out")
            .unwrap();

        conn.write_all(b"x").await.unwrap();
        conn.flush().await.unwrap();
        let mut echoed = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&echoed, b"x");

        conn.close();
        let _ = server.await.unwrap();
    }
}

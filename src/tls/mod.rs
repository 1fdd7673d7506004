//! Custom TLS dialer.
//!
//! Produces a TLS 1.2/1.3 client connection whose ClientHello matches one
//! of the fingerprint profiles (browser parrots or a seeded randomized
//! hello), with optional obfuscated session tickets, SNI policy, custom
//! certificate verification with SPKI pinning, RFC 7685 padding, and
//! passthrough-random carriage.

pub mod client_hello;
pub mod handshake;
pub mod keys;
pub mod profiles;
pub mod record;
pub mod session_ticket;
pub mod stream;
pub mod verify;

use std::io::{Error, ErrorKind, Result};
use std::net::IpAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite};

pub use profiles::{select_tls_profile, CustomTlsProfile, TlsParameters};
pub use stream::TlsClientStream;

use handshake::{client_handshake, HandshakeRequest, VerifyMode};
use profiles::{profile_shape, tls_profile_is_randomized};
use session_ticket::new_obfuscated_session_state;

/// Configuration for one custom TLS dial. The `parameters` set is owned by
/// the embedding application and consumed read-only.
pub struct CustomTlsConfig {
    pub parameters: Arc<TlsParameters>,

    /// Use the dial host name in the SNI server_name field.
    pub use_dial_addr_sni: bool,
    /// Literal SNI value; when this is empty and `use_dial_addr_sni` is
    /// unset, the server_name extension is omitted entirely.
    pub sni_server_name: String,

    /// Name that must appear in the server certificate, replacing the dial
    /// or SNI host name for verification purposes.
    pub verify_server_name: String,
    /// Base64 SPKI SHA-256 pins; at least one must match a certificate in
    /// the verified chain.
    pub verify_pins: Vec<String>,
    /// Exact-match legacy verification: the expected leaf DER. Mutually
    /// exclusive with the other verification options.
    pub verify_legacy_certificate: Option<Vec<u8>>,
    /// Disable certificate verification. Mutually exclusive with the other
    /// verification options.
    pub skip_verify: bool,
    /// PEM bundle of trusted roots; the bundled web PKI roots are used
    /// when unset.
    pub trusted_ca_certificates_pem: Option<Vec<u8>>,

    /// Pinned profile name; empty selects one at random.
    pub tls_profile: String,
    /// Seed for the randomized profile, enabling hello replay. A random
    /// seed is drawn when unset.
    pub randomized_tls_profile_seed: Option<[u8; 32]>,
    /// Blank the ClientHello session_id when not resuming. Unset applies
    /// the configured probability.
    pub no_default_tls_session_id: Option<bool>,
    /// RFC 7685 padding extension length, inserted at the front of the
    /// extension list. 0 disables; capped at 65535.
    pub tls_padding: usize,

    /// Hex key enabling obfuscated session tickets. Requires a TLS 1.2
    /// profile.
    pub obfuscated_session_ticket_key: String,
    /// 32 bytes written into the ClientHello random field, proving
    /// knowledge of the server's obfuscation key while remaining
    /// indistinguishable from random.
    pub passthrough_message: Option<[u8; 32]>,
}

impl CustomTlsConfig {
    pub fn new(parameters: Arc<TlsParameters>) -> Self {
        Self {
            parameters,
            use_dial_addr_sni: false,
            sni_server_name: String::new(),
            verify_server_name: String::new(),
            verify_pins: Vec::new(),
            verify_legacy_certificate: None,
            skip_verify: false,
            trusted_ca_certificates_pem: None,
            tls_profile: String::new(),
            randomized_tls_profile_seed: None,
            no_default_tls_session_id: None,
            tls_padding: 0,
            obfuscated_session_ticket_key: String::new(),
            passthrough_message: None,
        }
    }

    fn validate(&self) -> Result<()> {
        let verify_extras = !self.verify_server_name.is_empty() || !self.verify_pins.is_empty();
        if self.skip_verify && (self.verify_legacy_certificate.is_some() || verify_extras) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "incompatible certificate verification parameters",
            ));
        }
        if self.verify_legacy_certificate.is_some() && (self.skip_verify || verify_extras) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "incompatible certificate verification parameters",
            ));
        }
        Ok(())
    }
}

fn strip_port(dial_addr: &str) -> &str {
    // Accept "host", "host:port", and "[v6]:port".
    if let Some(stripped) = dial_addr.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &stripped[0..end];
        }
    }
    match dial_addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host
        }
        _ => dial_addr,
    }
}

fn is_ip_literal(name: &str) -> bool {
    name.parse::<IpAddr>().is_ok()
}

/// Dial TLS over an established transport connection. `dial_addr` is the
/// "host:port" (or bare host) the transport was dialed to; its host part
/// feeds the SNI and default verification name. Dropping the returned
/// future aborts the handshake.
pub async fn custom_tls_dial<S>(
    stream: S,
    dial_addr: &str,
    config: &CustomTlsConfig,
) -> Result<TlsClientStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    config.validate()?;

    let hostname = strip_port(dial_addr).to_string();

    // SNI policy. An empty value or IP literal means the extension is
    // stripped; a fingerprintable empty/unusual server_name never goes on
    // the wire.
    let sni: Option<String> = if config.use_dial_addr_sni {
        Some(hostname.clone())
    } else if !config.sni_server_name.is_empty() {
        Some(config.sni_server_name.clone())
    } else {
        None
    };
    let sni = sni.filter(|name| !is_ip_literal(name));

    let verify_server_name = if config.verify_server_name.is_empty() {
        hostname.clone()
    } else {
        config.verify_server_name.clone()
    };

    let verify = if config.skip_verify {
        VerifyMode::Skip
    } else if let Some(certificate_der) = &config.verify_legacy_certificate {
        VerifyMode::Legacy {
            certificate_der: certificate_der.clone(),
        }
    } else {
        VerifyMode::Chain {
            verify_server_name,
            pins: config.verify_pins.clone(),
            trusted_roots_pem: config.trusted_ca_certificates_pem.clone(),
        }
    };

    // Profile selection; a pinned profile skips the weighted selection
    // (and, as it is caller-chosen, the fronting disable lists). When an
    // obfuscated session ticket is in play, TLS 1.2 profiles that omit the
    // ticket extension are filtered out of the candidate set up front.
    let require_tls12_session_tickets = !config.obfuscated_session_ticket_key.is_empty();
    let profile = if config.tls_profile.is_empty() {
        select_tls_profile(require_tls12_session_tickets, false, "", &config.parameters)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "no TLS profile available"))?
    } else {
        config.tls_profile.clone()
    };

    let is_randomized = tls_profile_is_randomized(&profile);
    let randomized_seed = if is_randomized {
        Some(config.randomized_tls_profile_seed.unwrap_or_else(|| {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            seed
        }))
    } else {
        None
    };

    let shape = profile_shape(&profile, randomized_seed, &config.parameters)?;

    // Browsers do not use dynamic record sizing, so it is disabled for all
    // parrots and coin-flipped (replayably) for the randomized profile.
    let dynamic_record_sizing = match randomized_seed {
        Some(seed) => {
            let mut salted = seed;
            salted[0] ^= 0x72;
            StdRng::from_seed(salted).gen_bool(0.5)
        }
        None => false,
    };

    // Obfuscated session tickets hide the server certificate, which only
    // works when the server cannot negotiate TLS 1.3.
    let obfuscated_session = if config.obfuscated_session_ticket_key.is_empty() {
        None
    } else {
        if shape.offer_tls13 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "obfuscated session tickets require a TLS 1.2 profile",
            ));
        }
        if shape.omits_session_tickets {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "selected profile omits the session ticket extension",
            ));
        }
        Some(new_obfuscated_session_state(
            &config.obfuscated_session_ticket_key,
        )?)
    };

    // Session ID: resumption needs one (the server echoes it to accept the
    // ticket); otherwise the blank-session-id policy applies.
    let session_id = if obfuscated_session.is_some() {
        random_session_id()
    } else {
        let blank = match config.no_default_tls_session_id {
            Some(blank) => blank,
            None => rand::thread_rng()
                .gen_bool(config.parameters.no_default_tls_session_id_probability.clamp(0.0, 1.0)),
        };
        if blank {
            Vec::new()
        } else {
            random_session_id()
        }
    };

    let random = match config.passthrough_message {
        Some(message) => message,
        None => {
            let mut random = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut random);
            random
        }
    };

    let padding_override = if config.tls_padding > 0 {
        Some(config.tls_padding.min(65535))
    } else {
        None
    };

    client_handshake(
        stream,
        HandshakeRequest {
            shape,
            random,
            session_id,
            server_name_ext: sni,
            padding_override,
            obfuscated_session,
            verify,
            dynamic_record_sizing,
        },
    )
    .await
}

fn random_session_id() -> Vec<u8> {
    let mut session_id = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut session_id);
    session_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use x509_parser::prelude::FromDer;

    /// Spawn a plain rustls TLS server on localhost that echoes one
    /// message, returning (address, leaf DER, leaf PEM).
    fn spawn_echo_tls_server(name: &str) -> (std::net::SocketAddr, Vec<u8>, Vec<u8>) {
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert_der = certified.cert.der().to_vec();
        let cert_pem = certified.cert.pem().into_bytes();
        let key_der = certified.key_pair.serialize_der();

        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert_der.clone())],
            rustls::pki_types::PrivateKeyDer::try_from(key_der).unwrap(),
        )
        .unwrap();
        let server_config = Arc::new(server_config);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let (mut tcp, _) = listener.accept().unwrap();
            let mut connection = rustls::ServerConnection::new(server_config).unwrap();
            let mut tls = rustls::Stream::new(&mut connection, &mut tcp);

            let mut buffer = [0u8; 5];
            if tls.read_exact(&mut buffer).is_ok() {
                let _ = tls.write_all(&buffer);
                let _ = tls.flush();
            }
        });

        (addr, cert_der, cert_pem)
    }

    #[tokio::test]
    async fn test_tls13_handshake_against_rustls_server() {
        let (addr, _der, pem) = spawn_echo_tls_server("pinned.example");

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();

        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.tls_profile = profiles::TLS_PROFILE_CHROME_83.to_string();
        // SNI omitted entirely; verification runs on the custom path
        // against the configured root and name.
        config.verify_server_name = "pinned.example".to_string();
        config.trusted_ca_certificates_pem = Some(pem);

        let mut tls = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            custom_tls_dial(tcp, "pinned.example:443", &config),
        )
        .await
        .expect("handshake timed out")
        .unwrap();
        assert!(tls.negotiated_tls13());

        tls.write_all(b"hello").await.unwrap();
        tls.flush().await.unwrap();
        let mut echoed = [0u8; 5];
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            tls.read_exact(&mut echoed),
        )
        .await
        .expect("echo timed out")
        .unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn test_tls13_handshake_with_pin_and_no_sni() {
        let (addr, der, pem) = spawn_echo_tls_server("pinned.example");

        // Pin the leaf SPKI; the dial carries no SNI at all.
        let (_, certificate) =
            x509_parser::certificate::X509Certificate::from_der(&der).unwrap();
        let pin = verify::spki_pin(certificate.public_key().raw);

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.tls_profile = profiles::TLS_PROFILE_CHROME_70.to_string();
        config.verify_server_name = "pinned.example".to_string();
        config.verify_pins = vec![pin];
        config.trusted_ca_certificates_pem = Some(pem);

        let tls = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            custom_tls_dial(tcp, "pinned.example:443", &config),
        )
        .await
        .expect("handshake timed out")
        .unwrap();
        assert!(tls.negotiated_tls13());
    }

    #[tokio::test]
    async fn test_tls13_handshake_wrong_pin_fails() {
        let (addr, _der, pem) = spawn_echo_tls_server("pinned.example");

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.tls_profile = profiles::TLS_PROFILE_CHROME_83.to_string();
        config.verify_server_name = "pinned.example".to_string();
        config.verify_pins = vec!["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()];
        config.trusted_ca_certificates_pem = Some(pem);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            custom_tls_dial(tcp, "pinned.example:443", &config),
        )
        .await
        .expect("handshake timed out");
        assert!(result.is_err());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("192.0.2.1:443"), "192.0.2.1");
    }

    #[test]
    fn test_incompatible_verification_parameters() {
        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.skip_verify = true;
        config.verify_pins = vec!["cGlu".to_string()];
        assert!(config.validate().is_err());

        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.verify_legacy_certificate = Some(vec![1, 2, 3]);
        config.verify_server_name = "example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.skip_verify = true;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_obfuscated_ticket_refuses_tls13_profile() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.tls_profile = profiles::TLS_PROFILE_CHROME_83.to_string();
        config.obfuscated_session_ticket_key = "00".repeat(32);
        config.skip_verify = true;

        let err = custom_tls_dial(client_io, "example.com:443", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_obfuscated_ticket_filters_ticketless_profiles_up_front() {
        // With automatic selection restricted to a ticket-omitting TLS 1.2
        // profile, an obfuscated-ticket dial must find no candidate at all
        // rather than select it and fail later.
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let parameters = TlsParameters {
            limit_tls_profiles: vec![profiles::TLS_PROFILE_IOS_121.to_string()],
            ..Default::default()
        };
        let mut config = CustomTlsConfig::new(Arc::new(parameters));
        config.obfuscated_session_ticket_key = "00".repeat(32);
        config.skip_verify = true;

        let err = custom_tls_dial(client_io, "example.com:443", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("no TLS profile available"));
    }

    #[tokio::test]
    async fn test_obfuscated_ticket_refuses_ticketless_profile() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let mut config = CustomTlsConfig::new(Arc::new(TlsParameters::default()));
        config.tls_profile = profiles::TLS_PROFILE_IOS_121.to_string();
        config.obfuscated_session_ticket_key = "00".repeat(32);
        config.skip_verify = true;

        let err = custom_tls_dial(client_io, "example.com:443", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}

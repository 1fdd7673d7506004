//! rustls configuration for the QUIC layer.
//!
//! The QUIC TLS layer is not where the tunnel's security comes from (the
//! tunneled payload carries its own authenticated encryption), so the
//! server uses an in-process self-signed certificate with a random
//! hostname, and the client skips verification entirely.

use std::io;
use std::sync::{Arc, OnceLock};

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const ALPN_H3: &[u8] = b"h3";

fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

fn random_hostname() -> String {
    let mut rng = rand::thread_rng();
    let label_len = rng.gen_range(4..12);
    let label: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .filter(|c| c.is_ascii_alphabetic())
        .take(label_len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}.com", label)
}

/// Self-signed server config with ALPN h3.
pub fn new_server_config() -> io::Result<Arc<rustls::ServerConfig>> {
    let certified =
        rcgen::generate_simple_self_signed(vec![random_hostname()]).map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("generate certificate: {}", e))
        })?;

    let cert_der = rustls::pki_types::CertificateDer::from(certified.cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(
        certified.key_pair.serialize_der(),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("serialize key: {}", e)))?;

    let mut config = rustls::ServerConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("tls versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("server config: {}", e)))?;

    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct DisabledVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Client config that accepts any server certificate; the dial is
/// authenticated by the obfuscation layer, not by PKI.
pub fn new_insecure_client_config() -> Arc<rustls::ClientConfig> {
    let provider = get_crypto_provider();
    let verifier = DisabledVerifier {
        supported_algs: provider.signature_verification_algorithms,
    };
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are supported")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builds() {
        let config = new_server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_H3.to_vec()]);
    }

    #[test]
    fn test_random_hostname_shape() {
        let name = random_hostname();
        assert!(name.ends_with(".com"));
        assert!(name.len() > 4);
    }
}

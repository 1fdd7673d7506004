//! Certificate verification for the custom TLS dialer.
//!
//! The custom path runs whenever SNI is omitted or the name to verify
//! differs from the SNI: the presented chain is path-validated against the
//! configured roots (or the bundled web PKI roots) for the verify name,
//! and SPKI pins, when configured, must match at least one certificate in
//! the chain. The legacy mode instead requires an exact DER match of the
//! presented leaf.

use std::io::{Error, ErrorKind, Result};

use aws_lc_rs::digest;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};
use x509_parser::prelude::FromDer;

/// Base64 SPKI SHA-256 digest, the pin representation.
pub fn spki_pin(spki_der: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA256, spki_der);
    BASE64_STANDARD.encode(digest.as_ref())
}

fn certificate_spki(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, certificate) = x509_parser::certificate::X509Certificate::from_der(cert_der)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("parse certificate: {}", e)))?;
    Ok(certificate.public_key().raw.to_vec())
}

fn signature_algorithms() -> &'static [&'static dyn rustls::pki_types::SignatureVerificationAlgorithm]
{
    rustls::crypto::aws_lc_rs::default_provider()
        .signature_verification_algorithms
        .all
}

fn parse_roots_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    use rustls::pki_types::pem::PemObject;
    let mut roots = Vec::new();
    for cert in CertificateDer::pem_slice_iter(pem) {
        let cert = cert
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("parse root PEM: {:?}", e)))?;
        roots.push(cert.into_owned());
    }
    if roots.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "no roots in trust file"));
    }
    Ok(roots)
}

/// Path-validate the presented chain for `verify_server_name`, then check
/// pins over every certificate in the validated path.
pub fn verify_server_certificate(
    raw_certs: &[Vec<u8>],
    verify_server_name: &str,
    pins: &[String],
    trusted_roots_pem: Option<&[u8]>,
) -> Result<()> {
    if raw_certs.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "missing certificate"));
    }

    let end_entity_der = CertificateDer::from(raw_certs[0].clone());
    let end_entity = EndEntityCert::try_from(&end_entity_der)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("parse leaf: {}", e)))?;

    let intermediates: Vec<CertificateDer> = raw_certs[1..]
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();

    // Roots: the configured trust file, or the bundled web PKI set.
    let configured_roots = match trusted_roots_pem {
        Some(pem) => Some(parse_roots_pem(pem)?),
        None => None,
    };
    let anchors = match &configured_roots {
        Some(roots) => roots
            .iter()
            .map(|root| {
                anchor_from_trusted_cert(root).map(|anchor| anchor.to_owned()).map_err(|e| {
                    Error::new(ErrorKind::InvalidData, format!("parse root: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let path = end_entity
        .verify_for_usage(
            signature_algorithms(),
            &anchors,
            &intermediates,
            UnixTime::now(),
            KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| {
            Error::new(
                ErrorKind::InvalidData,
                format!("certificate verification failed: {}", e),
            )
        })?;

    let server_name = ServerName::try_from(verify_server_name.to_string()).map_err(|e| {
        Error::new(ErrorKind::InvalidInput, format!("invalid verify name: {}", e))
    })?;
    end_entity
        .verify_is_valid_for_subject_name(&server_name)
        .map_err(|e| {
            Error::new(
                ErrorKind::InvalidData,
                format!("certificate name verification failed: {}", e),
            )
        })?;

    if !pins.is_empty() {
        // Scan the whole chain: a pin may name the leaf, an intermediate,
        // or the anchoring root.
        let mut chain_pins = Vec::with_capacity(raw_certs.len() + 1);
        for cert in raw_certs {
            chain_pins.push(spki_pin(&certificate_spki(cert)?));
        }
        chain_pins.push(spki_pin(path.anchor().subject_public_key_info.as_ref()));

        let matched = pins.iter().any(|pin| chain_pins.iter().any(|p| p == pin));
        if !matched {
            return Err(Error::new(ErrorKind::InvalidData, "no certificate pin found"));
        }
    }

    Ok(())
}

/// Check SPKI pins against a verified chain's certificates; used by the
/// standard-verification path where the chain was already validated.
pub fn verify_certificate_pins(pins: &[String], raw_certs: &[Vec<u8>]) -> Result<()> {
    for cert in raw_certs {
        let pin = spki_pin(&certificate_spki(cert)?);
        if pins.iter().any(|p| *p == pin) {
            return Ok(());
        }
    }
    Err(Error::new(ErrorKind::InvalidData, "no certificate pin found"))
}

/// Legacy verification: the server must present exactly the expected
/// certificate as its leaf. No chain building, no name checks.
pub fn verify_legacy_certificate(raw_certs: &[Vec<u8>], expected_der: &[u8]) -> Result<()> {
    let leaf = raw_certs
        .first()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing certificate"))?;
    if leaf.as_slice() != expected_der {
        return Err(Error::new(ErrorKind::InvalidData, "unexpected certificate"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(name: &str) -> (Vec<u8>, Vec<u8>) {
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let der = certified.cert.der().to_vec();
        let pem = certified.cert.pem().into_bytes();
        (der, pem)
    }

    #[test]
    fn test_legacy_exact_match() {
        let (der, _) = self_signed("legacy.example");
        assert!(verify_legacy_certificate(&[der.clone()], &der).is_ok());
        let (other, _) = self_signed("other.example");
        assert!(verify_legacy_certificate(&[other], &der).is_err());
        assert!(verify_legacy_certificate(&[], &der).is_err());
    }

    #[test]
    fn test_pins_match_spki() {
        let (der, _) = self_signed("pin.example");
        let spki = certificate_spki(&der).unwrap();
        let pin = spki_pin(&spki);
        assert!(verify_certificate_pins(&[pin], &[der.clone()]).is_ok());
        assert!(verify_certificate_pins(&["bm90LWEtcGlu".to_string()], &[der]).is_err());
    }

    #[test]
    fn test_chain_verify_with_configured_root() {
        // Self-signed cert acting as its own root, trusted explicitly.
        let (der, pem) = self_signed("pinned.example");
        let spki_pin_value = spki_pin(&certificate_spki(&der).unwrap());

        let result = verify_server_certificate(
            &[der.clone()],
            "pinned.example",
            &[spki_pin_value],
            Some(&pem),
        );
        assert!(result.is_ok(), "verification failed: {:?}", result.err());

        // Wrong name must fail even with the root trusted.
        assert!(verify_server_certificate(
            &[der.clone()],
            "wrong.example",
            &[],
            Some(&pem)
        )
        .is_err());

        // Wrong pin must fail even though the chain verifies.
        assert!(verify_server_certificate(
            &[der],
            "pinned.example",
            &["bm90LWEtcGlu".to_string()],
            Some(&pem)
        )
        .is_err());
    }

    #[test]
    fn test_chain_verify_untrusted_fails() {
        let (der, _) = self_signed("untrusted.example");
        assert!(verify_server_certificate(&[der], "untrusted.example", &[], None).is_err());
    }
}

//! TLS key derivation: the RFC 8446 key schedule for TLS 1.3 (HKDF over
//! the suite hash) and the RFC 5246 PRF for the TLS 1.2 resumption path.

use std::io::{Error, ErrorKind, Result};

use aws_lc_rs::aead;
use aws_lc_rs::digest;
use aws_lc_rs::hmac;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteHash {
    Sha256,
    Sha384,
}

impl SuiteHash {
    pub fn output_len(self) -> usize {
        match self {
            SuiteHash::Sha256 => 32,
            SuiteHash::Sha384 => 48,
        }
    }

    fn hmac_algorithm(self) -> hmac::Algorithm {
        match self {
            SuiteHash::Sha256 => hmac::HMAC_SHA256,
            SuiteHash::Sha384 => hmac::HMAC_SHA384,
        }
    }

    fn digest_algorithm(self) -> &'static digest::Algorithm {
        match self {
            SuiteHash::Sha256 => &digest::SHA256,
            SuiteHash::Sha384 => &digest::SHA384,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        digest::digest(self.digest_algorithm(), data).as_ref().to_vec()
    }
}

/// TLS 1.3 cipher suites this client can actually negotiate. ClientHello
/// templates may advertise more for fingerprint fidelity; a server
/// selecting an unsupported suite fails the dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1302 => Some(CipherSuite::Aes256GcmSha384),
            0x1303 => Some(CipherSuite::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }

    pub fn id(self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::Aes256GcmSha384 => 0x1302,
            CipherSuite::ChaCha20Poly1305Sha256 => 0x1303,
        }
    }

    pub fn hash(self) -> SuiteHash {
        match self {
            CipherSuite::Aes256GcmSha384 => SuiteHash::Sha384,
            _ => SuiteHash::Sha256,
        }
    }

    pub fn aead_algorithm(self) -> &'static aead::Algorithm {
        match self {
            CipherSuite::Aes128GcmSha256 => &aead::AES_128_GCM,
            CipherSuite::Aes256GcmSha384 => &aead::AES_256_GCM,
            CipherSuite::ChaCha20Poly1305Sha256 => &aead::CHACHA20_POLY1305,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            _ => 32,
        }
    }
}

pub fn hkdf_extract(hash: SuiteHash, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hash.hmac_algorithm(), salt);
    hmac::sign(&key, ikm).as_ref().to_vec()
}

/// RFC 5869 HKDF-Expand via HMAC directly, since the PRK bytes are needed
/// across extract/expand stages.
pub fn hkdf_expand(hash: SuiteHash, prk: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hash_len = hash.output_len();
    let n = length.div_ceil(hash_len);
    if n > 255 {
        return Err(Error::new(ErrorKind::InvalidInput, "HKDF output too long"));
    }

    let key = hmac::Key::new(hash.hmac_algorithm(), prk);
    let mut output = Vec::with_capacity(n * hash_len);
    let mut previous: Vec<u8> = Vec::new();

    for i in 1..=n {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&previous);
        ctx.update(info);
        ctx.update(&[i as u8]);
        let tag = ctx.sign();
        previous = tag.as_ref().to_vec();
        output.extend_from_slice(tag.as_ref());
    }

    output.truncate(length);
    Ok(output)
}

/// HKDF-Expand-Label per RFC 8446 §7.1.
pub fn hkdf_expand_label(
    hash: SuiteHash,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Vec<u8>> {
    let mut hkdf_label = Vec::with_capacity(4 + 6 + label.len() + context.len());
    hkdf_label.extend_from_slice(&(length as u16).to_be_bytes());
    hkdf_label.push((6 + label.len()) as u8);
    hkdf_label.extend_from_slice(b"tls13 ");
    hkdf_label.extend_from_slice(label);
    hkdf_label.push(context.len() as u8);
    hkdf_label.extend_from_slice(context);

    hkdf_expand(hash, secret, &hkdf_label, length)
}

pub fn derive_secret(
    hash: SuiteHash,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>> {
    hkdf_expand_label(hash, secret, label, transcript_hash, hash.output_len())
}

/// Handshake-phase secrets plus the master secret for the later
/// application-phase derivation.
pub struct HandshakeSecrets {
    pub client_handshake_traffic: Vec<u8>,
    pub server_handshake_traffic: Vec<u8>,
    pub master_secret: Vec<u8>,
}

/// Phase 1 of the TLS 1.3 schedule: everything derivable once the
/// ServerHello (and thus the ECDH shared secret) is known.
pub fn derive_handshake_secrets(
    hash: SuiteHash,
    shared_secret: &[u8],
    hello_transcript_hash: &[u8],
) -> Result<HandshakeSecrets> {
    let zeros = vec![0u8; hash.output_len()];

    let early_secret = hkdf_extract(hash, &zeros, &zeros);
    let empty_hash = hash.hash(b"");
    let derived = derive_secret(hash, &early_secret, b"derived", &empty_hash)?;

    let handshake_secret = hkdf_extract(hash, &derived, shared_secret);
    let client_handshake_traffic =
        derive_secret(hash, &handshake_secret, b"c hs traffic", hello_transcript_hash)?;
    let server_handshake_traffic =
        derive_secret(hash, &handshake_secret, b"s hs traffic", hello_transcript_hash)?;

    let derived = derive_secret(hash, &handshake_secret, b"derived", &empty_hash)?;
    let master_secret = hkdf_extract(hash, &derived, &zeros);

    Ok(HandshakeSecrets {
        client_handshake_traffic,
        server_handshake_traffic,
        master_secret,
    })
}

/// Phase 2: application traffic secrets, bound to the transcript through
/// the server Finished.
pub fn derive_application_secrets(
    hash: SuiteHash,
    master_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let client = derive_secret(hash, master_secret, b"c ap traffic", transcript_hash)?;
    let server = derive_secret(hash, master_secret, b"s ap traffic", transcript_hash)?;
    Ok((client, server))
}

/// Per-record key material from a traffic secret.
pub fn derive_traffic_key_iv(suite: CipherSuite, traffic_secret: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let hash = suite.hash();
    let key = hkdf_expand_label(hash, traffic_secret, b"key", b"", suite.key_len())?;
    let iv = hkdf_expand_label(hash, traffic_secret, b"iv", b"", 12)?;
    Ok((key, iv))
}

/// Next-generation traffic secret for a KeyUpdate.
pub fn update_traffic_secret(suite: CipherSuite, traffic_secret: &[u8]) -> Result<Vec<u8>> {
    let hash = suite.hash();
    hkdf_expand_label(hash, traffic_secret, b"traffic upd", b"", hash.output_len())
}

/// Finished verify_data per RFC 8446 §4.4.4.
pub fn finished_verify_data(
    hash: SuiteHash,
    base_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>> {
    let finished_key =
        hkdf_expand_label(hash, base_secret, b"finished", b"", hash.output_len())?;
    let key = hmac::Key::new(hash.hmac_algorithm(), &finished_key);
    Ok(hmac::sign(&key, transcript_hash).as_ref().to_vec())
}

/// TLS 1.2 PRF (P_SHA256) per RFC 5246 §5.
pub fn tls12_prf(secret: &[u8], label: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);

    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut output = Vec::with_capacity(length);
    let mut a = hmac::sign(&key, &label_seed).as_ref().to_vec();
    while output.len() < length {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&a);
        ctx.update(&label_seed);
        output.extend_from_slice(ctx.sign().as_ref());
        a = hmac::sign(&key, &a).as_ref().to_vec();
    }
    output.truncate(length);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5869 Appendix A, Test Case 1 (expand stage).
    #[test]
    fn test_hkdf_expand_rfc_vector() {
        let prk = [
            0x07, 0x77, 0x09, 0x36, 0x2c, 0x2e, 0x32, 0xdf, 0x0d, 0xdc, 0x3f, 0x0d, 0xc4, 0x7b,
            0xba, 0x63, 0x90, 0xb6, 0xc7, 0x3b, 0xb5, 0x0f, 0x9c, 0x31, 0x22, 0xec, 0x84, 0x4a,
            0xd7, 0xc2, 0xb3, 0xe5,
        ];
        let info = [0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9];
        let okm = hkdf_expand(SuiteHash::Sha256, &prk, &info, 42).unwrap();
        assert_eq!(
            &okm[0..8],
            &[0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a]
        );
        assert_eq!(okm.len(), 42);
    }

    #[test]
    fn test_hkdf_expand_too_long() {
        let prk = [0x42u8; 32];
        assert!(hkdf_expand(SuiteHash::Sha256, &prk, b"", 255 * 32).is_ok());
        assert!(hkdf_expand(SuiteHash::Sha256, &prk, b"", 255 * 32 + 1).is_err());
    }

    #[test]
    fn test_expand_label_deterministic() {
        let secret = [0x42u8; 32];
        let a = hkdf_expand_label(SuiteHash::Sha256, &secret, b"key", b"", 16).unwrap();
        let b = hkdf_expand_label(SuiteHash::Sha256, &secret, b"key", b"", 16).unwrap();
        assert_eq!(a, b);
        let c = hkdf_expand_label(SuiteHash::Sha256, &secret, b"iv", b"", 16).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_handshake_secret_shapes() {
        let shared = [0x11u8; 32];
        let transcript = SuiteHash::Sha384.hash(b"hello");
        let secrets =
            derive_handshake_secrets(SuiteHash::Sha384, &shared, &transcript).unwrap();
        assert_eq!(secrets.client_handshake_traffic.len(), 48);
        assert_eq!(secrets.server_handshake_traffic.len(), 48);
        assert_eq!(secrets.master_secret.len(), 48);
        assert_ne!(
            secrets.client_handshake_traffic,
            secrets.server_handshake_traffic
        );
    }

    #[test]
    fn test_traffic_key_lengths() {
        let secret = [0x99u8; 32];
        let (key, iv) = derive_traffic_key_iv(CipherSuite::Aes128GcmSha256, &secret).unwrap();
        assert_eq!(key.len(), 16);
        assert_eq!(iv.len(), 12);

        let secret = [0x99u8; 48];
        let (key, iv) = derive_traffic_key_iv(CipherSuite::Aes256GcmSha384, &secret).unwrap();
        assert_eq!(key.len(), 32);
        assert_eq!(iv.len(), 12);
    }

    // RFC-shape check for the TLS 1.2 PRF: deterministic, variable length.
    #[test]
    fn test_tls12_prf() {
        let secret = [0xabu8; 48];
        let a = tls12_prf(&secret, b"key expansion", &[1, 2, 3], 40);
        let b = tls12_prf(&secret, b"key expansion", &[1, 2, 3], 40);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        let c = tls12_prf(&secret, b"client finished", &[1, 2, 3], 12);
        assert_eq!(c.len(), 12);
        assert_ne!(&a[0..12], &c[..]);
    }
}

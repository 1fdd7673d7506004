//! Async TLS client handshake.
//!
//! Drives a full TLS 1.3 handshake, or an abbreviated TLS 1.2 resumption
//! when an obfuscated session ticket is in play. The ClientHello bytes are
//! entirely under our control (see client_hello.rs); everything after it
//! follows the RFCs with no fingerprint-relevant traffic of its own.

use std::io::{Error, ErrorKind, Result};

use aws_lc_rs::agreement;
use aws_lc_rs::signature::{self, UnparsedPublicKey};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x509_parser::prelude::FromDer;

use super::client_hello::{build_client_hello, parse_server_hello, HelloParams, HelloShape};
use super::keys::{
    derive_application_secrets, derive_handshake_secrets, derive_traffic_key_iv,
    finished_verify_data, tls12_prf, CipherSuite, SuiteHash,
};
use super::record::{
    Tls12GcmCodec, Tls13RecordCodec, CONTENT_TYPE_ALERT, CONTENT_TYPE_CHANGE_CIPHER_SPEC,
    CONTENT_TYPE_HANDSHAKE, MAX_TLS_CIPHERTEXT_LEN, TLS_RECORD_HEADER_LEN,
};
use super::session_ticket::ObfuscatedSessionState;
use super::stream::{StreamProtection, TlsClientStream};
use super::verify;

const HANDSHAKE_NEW_SESSION_TICKET: u8 = 0x04;
const HANDSHAKE_ENCRYPTED_EXTENSIONS: u8 = 0x08;
const HANDSHAKE_CERTIFICATE: u8 = 0x0b;
const HANDSHAKE_CERTIFICATE_VERIFY: u8 = 0x0f;
const HANDSHAKE_FINISHED: u8 = 0x14;

/// How the peer's certificate chain is checked.
pub enum VerifyMode {
    /// No verification at all.
    Skip,
    /// Path validation for a server name (which may differ from the SNI),
    /// plus optional SPKI pins, against configured or bundled roots.
    Chain {
        verify_server_name: String,
        pins: Vec<String>,
        trusted_roots_pem: Option<Vec<u8>>,
    },
    /// Exact DER match of the presented leaf.
    Legacy { certificate_der: Vec<u8> },
}

pub struct HandshakeRequest {
    pub shape: HelloShape,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    /// Value for the server_name extension; None strips it.
    pub server_name_ext: Option<String>,
    pub padding_override: Option<usize>,
    pub obfuscated_session: Option<ObfuscatedSessionState>,
    pub verify: VerifyMode,
    pub dynamic_record_sizing: bool,
}

enum ReadProtection {
    Plaintext,
    Tls13(Tls13RecordCodec),
    Tls12(Tls12GcmCodec),
}

/// Record-layer transport for the handshake phase: reads records, applies
/// the active protection, and reassembles handshake messages that span
/// records.
struct HandshakeTransport<S> {
    stream: S,
    pending: Vec<u8>,
    read_protection: ReadProtection,
    /// Installed when a ChangeCipherSpec arrives (TLS 1.2 semantics).
    armed_protection: Option<ReadProtection>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HandshakeTransport<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            read_protection: ReadProtection::Plaintext,
            armed_protection: None,
        }
    }

    async fn read_record(&mut self) -> Result<(u8, [u8; TLS_RECORD_HEADER_LEN], Vec<u8>)> {
        let mut header = [0u8; TLS_RECORD_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        if length == 0 || length > MAX_TLS_CIPHERTEXT_LEN + 16 {
            return Err(Error::new(ErrorKind::InvalidData, "invalid record length"));
        }
        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body).await?;
        Ok((header[0], header, body))
    }

    /// Return the next complete handshake message (header included).
    async fn next_handshake_message(&mut self) -> Result<Vec<u8>> {
        loop {
            if self.pending.len() >= 4 {
                let length = u32::from_be_bytes([
                    0,
                    self.pending[1],
                    self.pending[2],
                    self.pending[3],
                ]) as usize;
                if self.pending.len() >= 4 + length {
                    let message: Vec<u8> = self.pending.drain(0..4 + length).collect();
                    return Ok(message);
                }
            }

            let (record_type, header, body) = self.read_record().await?;
            match record_type {
                CONTENT_TYPE_CHANGE_CIPHER_SPEC => {
                    if let Some(protection) = self.armed_protection.take() {
                        self.read_protection = protection;
                    }
                }
                CONTENT_TYPE_ALERT => {
                    return Err(alert_error(&body));
                }
                CONTENT_TYPE_HANDSHAKE => match &mut self.read_protection {
                    ReadProtection::Plaintext => self.pending.extend_from_slice(&body),
                    ReadProtection::Tls12(codec) => {
                        let plaintext = codec.open(CONTENT_TYPE_HANDSHAKE, &body)?;
                        self.pending.extend_from_slice(&plaintext);
                    }
                    ReadProtection::Tls13(_) => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "unexpected plaintext handshake record",
                        ));
                    }
                },
                super::record::CONTENT_TYPE_APPLICATION_DATA => {
                    match &mut self.read_protection {
                        ReadProtection::Tls13(codec) => {
                            let (content_type, plaintext) = codec.open(&header, &body)?;
                            match content_type {
                                CONTENT_TYPE_HANDSHAKE => {
                                    self.pending.extend_from_slice(&plaintext)
                                }
                                CONTENT_TYPE_ALERT => return Err(alert_error(&plaintext)),
                                _ => {
                                    return Err(Error::new(
                                        ErrorKind::InvalidData,
                                        "unexpected record during handshake",
                                    ));
                                }
                            }
                        }
                        _ => {
                            return Err(Error::new(
                                ErrorKind::InvalidData,
                                "unexpected encrypted record during handshake",
                            ));
                        }
                    }
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("unexpected record type: {}", other),
                    ));
                }
            }
        }
    }
}

fn alert_error(body: &[u8]) -> Error {
    // close_notify during the handshake still aborts it.
    let description = body.get(1).copied().unwrap_or(0);
    Error::new(
        ErrorKind::ConnectionAborted,
        format!("received TLS alert: {}", description),
    )
}

fn handshake_record(payload: &[u8], legacy_version_first_byte: bool) -> Vec<u8> {
    let mut record = Vec::with_capacity(TLS_RECORD_HEADER_LEN + payload.len());
    record.push(CONTENT_TYPE_HANDSHAKE);
    // The first flight uses record version 0x0301, as browsers do.
    if legacy_version_first_byte {
        record.extend_from_slice(&[0x03, 0x01]);
    } else {
        record.extend_from_slice(&[0x03, 0x03]);
    }
    record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    record.extend_from_slice(payload);
    record
}

const CHANGE_CIPHER_SPEC_RECORD: [u8; 6] = [0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

/// Parse the certificate list out of a TLS 1.3 Certificate message.
fn parse_certificate_message(message: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = crate::buf_reader::BufReader::new(message);
    let message_type = reader.read_u8()?;
    if message_type != HANDSHAKE_CERTIFICATE {
        return Err(Error::new(ErrorKind::InvalidData, "expected Certificate"));
    }
    let _length = reader.read_u24_be()?;
    let context_len = reader.read_u8()? as usize;
    reader.skip(context_len)?;
    let list_len = reader.read_u24_be()? as usize;
    let list_end = reader.position() + list_len;

    let mut certificates = Vec::new();
    while reader.position() < list_end {
        let cert_len = reader.read_u24_be()? as usize;
        certificates.push(reader.read_slice(cert_len)?.to_vec());
        let extensions_len = reader.read_u16_be()? as usize;
        reader.skip(extensions_len)?;
    }
    if certificates.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "empty certificate list"));
    }
    Ok(certificates)
}

fn run_verification(verify: &VerifyMode, raw_certs: &[Vec<u8>]) -> Result<()> {
    match verify {
        VerifyMode::Skip => Ok(()),
        VerifyMode::Chain {
            verify_server_name,
            pins,
            trusted_roots_pem,
        } => verify::verify_server_certificate(
            raw_certs,
            verify_server_name,
            pins,
            trusted_roots_pem.as_deref(),
        ),
        VerifyMode::Legacy { certificate_der } => {
            verify::verify_legacy_certificate(raw_certs, certificate_der)
        }
    }
}

fn signature_algorithm(scheme: u16) -> Result<&'static dyn signature::VerificationAlgorithm> {
    Ok(match scheme {
        0x0403 => &signature::ECDSA_P256_SHA256_ASN1,
        0x0503 => &signature::ECDSA_P384_SHA384_ASN1,
        0x0804 => &signature::RSA_PSS_2048_8192_SHA256,
        0x0805 => &signature::RSA_PSS_2048_8192_SHA384,
        0x0806 => &signature::RSA_PSS_2048_8192_SHA512,
        0x0807 => &signature::ED25519,
        _ => {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("unsupported signature scheme: 0x{:04x}", scheme),
            ));
        }
    })
}

/// Check the CertificateVerify signature over the transcript hash.
fn verify_certificate_verify(
    message: &[u8],
    leaf_der: &[u8],
    transcript_hash: &[u8],
) -> Result<()> {
    let mut reader = crate::buf_reader::BufReader::new(message);
    let message_type = reader.read_u8()?;
    if message_type != HANDSHAKE_CERTIFICATE_VERIFY {
        return Err(Error::new(ErrorKind::InvalidData, "expected CertificateVerify"));
    }
    let _length = reader.read_u24_be()?;
    let scheme = reader.read_u16_be()?;
    let signature_len = reader.read_u16_be()? as usize;
    let signature_bytes = reader.read_slice(signature_len)?;

    let mut signed = vec![0x20u8; 64];
    signed.extend_from_slice(b"TLS 1.3, server CertificateVerify");
    signed.push(0x00);
    signed.extend_from_slice(transcript_hash);

    let (_, certificate) = x509_parser::certificate::X509Certificate::from_der(leaf_der)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("parse leaf: {}", e)))?;
    let public_key = certificate.public_key().subject_public_key.data.as_ref();

    let algorithm = signature_algorithm(scheme)?;
    UnparsedPublicKey::new(algorithm, public_key)
        .verify(&signed, signature_bytes)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "certificate verify signature invalid"))
}

/// Run the client handshake over `stream`, returning the protected
/// application stream.
pub async fn client_handshake<S>(
    stream: S,
    request: HandshakeRequest,
) -> Result<TlsClientStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Ephemeral X25519 key pair; only generated when the shape offers
    // TLS 1.3.
    let (private_key, public_key) = if request.shape.offer_tls13 {
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let private_key = agreement::PrivateKey::from_private_key(&agreement::X25519, &key_bytes)
            .map_err(|_| Error::new(ErrorKind::Other, "generate X25519 key"))?;
        let public = private_key
            .compute_public_key()
            .map_err(|_| Error::new(ErrorKind::Other, "compute X25519 public key"))?;
        let mut public_bytes = [0u8; 32];
        public_bytes.copy_from_slice(public.as_ref());
        (Some(private_key), Some(public_bytes))
    } else {
        (None, None)
    };

    let hello = build_client_hello(
        &request.shape,
        &HelloParams {
            random: request.random,
            session_id: request.session_id.clone(),
            server_name: request.server_name_ext.as_deref(),
            session_ticket: request
                .obfuscated_session
                .as_ref()
                .map(|s| s.ticket.as_slice()),
            key_share_public: public_key.as_ref(),
            padding_override: request.padding_override,
        },
        &mut rand::thread_rng(),
    )?;

    let mut transport = HandshakeTransport::new(stream);
    transport
        .stream
        .write_all(&handshake_record(&hello, true))
        .await?;
    transport.stream.flush().await?;

    let mut transcript: Vec<u8> = hello;

    let server_hello_message = transport.next_handshake_message().await?;
    let server_hello = parse_server_hello(&server_hello_message)?;
    transcript.extend_from_slice(&server_hello_message);

    if server_hello.is_tls13 {
        if !request.shape.offer_tls13 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "server negotiated TLS 1.3 against a 1.2-only hello",
            ));
        }
        tls13_handshake(
            transport,
            request,
            private_key.expect("key pair exists when TLS 1.3 offered"),
            server_hello.cipher_suite,
            server_hello.key_share_x25519,
            transcript,
        )
        .await
    } else {
        tls12_resumption_handshake(transport, request, server_hello, transcript).await
    }
}

async fn tls13_handshake<S>(
    mut transport: HandshakeTransport<S>,
    request: HandshakeRequest,
    private_key: agreement::PrivateKey,
    cipher_suite_id: u16,
    server_key_share: Option<[u8; 32]>,
    mut transcript: Vec<u8>,
) -> Result<TlsClientStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let suite = CipherSuite::from_id(cipher_suite_id).ok_or_else(|| {
        Error::new(
            ErrorKind::Unsupported,
            format!("server selected unsupported cipher suite: 0x{:04x}", cipher_suite_id),
        )
    })?;
    let hash = suite.hash();

    let server_public = server_key_share.ok_or_else(|| {
        Error::new(ErrorKind::InvalidData, "server hello missing X25519 key share")
    })?;

    let peer = agreement::UnparsedPublicKey::new(&agreement::X25519, &server_public);
    let shared_secret = agreement::agree(
        &private_key,
        &peer,
        Error::new(ErrorKind::InvalidData, "X25519 agreement failed"),
        |shared| Ok(shared.to_vec()),
    )?;

    let hello_hash = hash.hash(&transcript);
    let secrets = derive_handshake_secrets(hash, &shared_secret, &hello_hash)?;

    let (server_key, server_iv) = derive_traffic_key_iv(suite, &secrets.server_handshake_traffic)?;
    transport.read_protection =
        ReadProtection::Tls13(Tls13RecordCodec::new(suite, &server_key, &server_iv)?);

    let (client_key, client_iv) = derive_traffic_key_iv(suite, &secrets.client_handshake_traffic)?;
    let mut client_write = Tls13RecordCodec::new(suite, &client_key, &client_iv)?;

    let mut raw_certs: Option<Vec<Vec<u8>>> = None;
    loop {
        let message = transport.next_handshake_message().await?;
        match message[0] {
            HANDSHAKE_ENCRYPTED_EXTENSIONS => {
                transcript.extend_from_slice(&message);
            }
            HANDSHAKE_CERTIFICATE => {
                let certificates = parse_certificate_message(&message)?;
                run_verification(&request.verify, &certificates)?;
                raw_certs = Some(certificates);
                transcript.extend_from_slice(&message);
            }
            HANDSHAKE_CERTIFICATE_VERIFY => {
                let certificates = raw_certs.as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidData, "CertificateVerify before Certificate")
                })?;
                verify_certificate_verify(&message, &certificates[0], &hash.hash(&transcript))?;
                transcript.extend_from_slice(&message);
            }
            HANDSHAKE_FINISHED => {
                let expected =
                    finished_verify_data(hash, &secrets.server_handshake_traffic, &hash.hash(&transcript))?;
                if message.len() < 4 || message[4..] != expected[..] {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "server finished verification failed",
                    ));
                }
                transcript.extend_from_slice(&message);
                break;
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unexpected handshake message: {}", other),
                ));
            }
        }
    }

    // Application secrets bind the transcript through the server Finished.
    let transcript_hash = hash.hash(&transcript);
    let (client_app_secret, server_app_secret) =
        derive_application_secrets(hash, &secrets.master_secret, &transcript_hash)?;

    // Client flight: compatibility CCS, then Finished under the handshake
    // keys.
    let finished =
        finished_verify_data(hash, &secrets.client_handshake_traffic, &transcript_hash)?;
    let mut finished_message = Vec::with_capacity(4 + finished.len());
    finished_message.push(HANDSHAKE_FINISHED);
    finished_message.extend_from_slice(&(finished.len() as u32).to_be_bytes()[1..]);
    finished_message.extend_from_slice(&finished);
    let finished_record = client_write.seal(CONTENT_TYPE_HANDSHAKE, &finished_message)?;

    transport.stream.write_all(&CHANGE_CIPHER_SPEC_RECORD).await?;
    transport.stream.write_all(&finished_record).await?;
    transport.stream.flush().await?;

    let (read_key, read_iv) = derive_traffic_key_iv(suite, &server_app_secret)?;
    let (write_key, write_iv) = derive_traffic_key_iv(suite, &client_app_secret)?;

    let protection = StreamProtection::tls13(
        Tls13RecordCodec::new(suite, &read_key, &read_iv)?,
        Tls13RecordCodec::new(suite, &write_key, &write_iv)?,
        server_app_secret,
        client_app_secret,
    );

    Ok(TlsClientStream::new(
        transport.stream,
        protection,
        transport.pending,
        request.dynamic_record_sizing,
    ))
}

async fn tls12_resumption_handshake<S>(
    mut transport: HandshakeTransport<S>,
    request: HandshakeRequest,
    server_hello: super::client_hello::ServerHello,
    mut transcript: Vec<u8>,
) -> Result<TlsClientStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Only the obfuscated-session-ticket path supports TLS 1.2: we hold
    // the master secret, so the server must accept the resumption.
    let session = request.obfuscated_session.as_ref().ok_or_else(|| {
        Error::new(
            ErrorKind::Unsupported,
            "server requires a full TLS 1.2 handshake",
        )
    })?;
    if server_hello.session_id != request.session_id {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "server declined session ticket resumption",
        ));
    }
    if server_hello.cipher_suite != session.cipher_suite {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "server selected unexpected cipher suite: 0x{:04x}",
                server_hello.cipher_suite
            ),
        ));
    }

    // key_block = PRF(master, "key expansion", server_random || client_random)
    let mut key_seed = Vec::with_capacity(64);
    key_seed.extend_from_slice(&server_hello.random);
    key_seed.extend_from_slice(&request.random);
    let key_block = tls12_prf(&session.master_secret, b"key expansion", &key_seed, 40);

    let client_codec = Tls12GcmCodec::new(&key_block[0..16], &key_block[32..36])?;
    let server_codec = Tls12GcmCodec::new(&key_block[16..32], &key_block[36..40])?;

    // The server's Finished arrives after its ChangeCipherSpec.
    transport.armed_protection = Some(ReadProtection::Tls12(server_codec));

    let mut client_write = client_codec;

    loop {
        let message = transport.next_handshake_message().await?;
        match message[0] {
            HANDSHAKE_NEW_SESSION_TICKET => {
                // A refreshed ticket; the synthetic session is single-use,
                // so the contents are irrelevant but the transcript is not.
                transcript.extend_from_slice(&message);
            }
            HANDSHAKE_FINISHED => {
                let transcript_hash = SuiteHash::Sha256.hash(&transcript);
                let expected =
                    tls12_prf(&session.master_secret, b"server finished", &transcript_hash, 12);
                if message.len() != 4 + 12 || message[4..] != expected[..] {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "server finished verification failed",
                    ));
                }
                transcript.extend_from_slice(&message);
                break;
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unexpected handshake message: {}", other),
                ));
            }
        }
    }

    let transcript_hash = SuiteHash::Sha256.hash(&transcript);
    let verify_data = tls12_prf(&session.master_secret, b"client finished", &transcript_hash, 12);
    let mut finished_message = Vec::with_capacity(16);
    finished_message.push(HANDSHAKE_FINISHED);
    finished_message.extend_from_slice(&(verify_data.len() as u32).to_be_bytes()[1..]);
    finished_message.extend_from_slice(&verify_data);
    let finished_record = client_write.seal(CONTENT_TYPE_HANDSHAKE, &finished_message)?;

    transport.stream.write_all(&CHANGE_CIPHER_SPEC_RECORD).await?;
    transport.stream.write_all(&finished_record).await?;
    transport.stream.flush().await?;

    let server_read = match transport.read_protection {
        ReadProtection::Tls12(codec) => codec,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "server finished arrived without ChangeCipherSpec",
            ));
        }
    };

    Ok(TlsClientStream::new(
        transport.stream,
        StreamProtection::tls12(server_read, client_write),
        transport.pending,
        request.dynamic_record_sizing,
    ))
}

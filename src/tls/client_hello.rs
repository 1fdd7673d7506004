//! ClientHello construction from fingerprint shapes, and ServerHello
//! parsing.
//!
//! A `HelloShape` captures what distinguishes one browser fingerprint from
//! another: cipher order, extension order, groups, signature algorithms,
//! ALPN, and whether TLS 1.3 is offered. The builder renders a shape into
//! ClientHello bytes, applying the per-dial mutations (SNI policy, session
//! ticket injection, padding override, passthrough random).

use std::io::{Error, ErrorKind, Result};

use rand::RngCore;

use crate::buf_reader::BufReader;

pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_STATUS_REQUEST: u16 = 0x0005;
pub const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
pub const EXT_EC_POINT_FORMATS: u16 = 0x000b;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_SCT: u16 = 0x0012;
pub const EXT_PADDING: u16 = 0x0015;
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 0x0017;
pub const EXT_RECORD_SIZE_LIMIT: u16 = 0x001c;
pub const EXT_SESSION_TICKET: u16 = 0x0023;
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
pub const EXT_KEY_SHARE: u16 = 0x0033;
pub const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

pub const GROUP_X25519: u16 = 0x001d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionId {
    GreaseFirst,
    ServerName,
    ExtendedMasterSecret,
    RenegotiationInfo,
    SupportedGroups,
    EcPointFormats,
    SessionTicket,
    Alpn,
    StatusRequest,
    SignatureAlgorithms,
    SignedCertificateTimestamp,
    KeyShare,
    PskKeyExchangeModes,
    SupportedVersions,
    RecordSizeLimit,
    Padding,
    GreaseLast,
}

/// The rendering-relevant parts of a TLS fingerprint.
#[derive(Debug, Clone)]
pub struct HelloShape {
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<ExtensionId>,
    pub groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub alpn: Vec<String>,
    pub offer_tls13: bool,
    pub omits_session_tickets: bool,
}

/// Per-dial inputs to the builder.
pub struct HelloParams<'a> {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    /// None omits the server_name extension entirely.
    pub server_name: Option<&'a str>,
    /// Ticket carried in the session_ticket extension; None renders the
    /// extension empty (a fresh-session offer).
    pub session_ticket: Option<&'a [u8]>,
    pub key_share_public: Option<&'a [u8; 32]>,
    /// RFC 7685: replace any padding extension with one of this length at
    /// position 0.
    pub padding_override: Option<usize>,
}

fn grease_value(rng: &mut dyn RngCore) -> u16 {
    let k = (rng.next_u32() % 16) as u16;
    0x0a0a | (k << 12) | (k << 4)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn encode_server_name(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut payload = Vec::with_capacity(bytes.len() + 5);
    put_u16(&mut payload, (bytes.len() + 3) as u16);
    payload.push(0x00); // name_type host_name
    put_u16(&mut payload, bytes.len() as u16);
    payload.extend_from_slice(bytes);
    payload
}

fn encode_u16_list(values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + values.len() * 2);
    put_u16(&mut payload, (values.len() * 2) as u16);
    for value in values {
        put_u16(&mut payload, *value);
    }
    payload
}

fn encode_alpn(protocols: &[String]) -> Vec<u8> {
    let mut list = Vec::new();
    for protocol in protocols {
        list.push(protocol.len() as u8);
        list.extend_from_slice(protocol.as_bytes());
    }
    let mut payload = Vec::with_capacity(list.len() + 2);
    put_u16(&mut payload, list.len() as u16);
    payload.extend_from_slice(&list);
    payload
}

fn replace_grease(values: &[u16], rng: &mut dyn RngCore) -> Vec<u16> {
    values
        .iter()
        .map(|&v| {
            if v == GREASE_PLACEHOLDER {
                grease_value(rng)
            } else {
                v
            }
        })
        .collect()
}

/// Render a ClientHello handshake message (4-byte handshake header
/// included) from a shape and per-dial parameters.
pub fn build_client_hello(
    shape: &HelloShape,
    params: &HelloParams,
    rng: &mut dyn RngCore,
) -> Result<Vec<u8>> {
    // Materialize extension payloads in template order.
    let mut extensions: Vec<(u16, Vec<u8>)> = Vec::with_capacity(shape.extensions.len());
    let mut has_padding = false;

    for extension in &shape.extensions {
        match extension {
            ExtensionId::GreaseFirst | ExtensionId::GreaseLast => {
                extensions.push((grease_value(rng), Vec::new()));
            }
            ExtensionId::ServerName => {
                if let Some(name) = params.server_name {
                    extensions.push((EXT_SERVER_NAME, encode_server_name(name)));
                }
            }
            ExtensionId::ExtendedMasterSecret => {
                extensions.push((EXT_EXTENDED_MASTER_SECRET, Vec::new()));
            }
            ExtensionId::RenegotiationInfo => {
                extensions.push((EXT_RENEGOTIATION_INFO, vec![0x00]));
            }
            ExtensionId::SupportedGroups => {
                extensions.push((
                    EXT_SUPPORTED_GROUPS,
                    encode_u16_list(&replace_grease(&shape.groups, rng)),
                ));
            }
            ExtensionId::EcPointFormats => {
                extensions.push((EXT_EC_POINT_FORMATS, vec![0x01, 0x00]));
            }
            ExtensionId::SessionTicket => {
                let payload = params.session_ticket.map(|t| t.to_vec()).unwrap_or_default();
                extensions.push((EXT_SESSION_TICKET, payload));
            }
            ExtensionId::Alpn => {
                if !shape.alpn.is_empty() {
                    extensions.push((EXT_ALPN, encode_alpn(&shape.alpn)));
                }
            }
            ExtensionId::StatusRequest => {
                extensions.push((EXT_STATUS_REQUEST, vec![0x01, 0x00, 0x00, 0x00, 0x00]));
            }
            ExtensionId::SignatureAlgorithms => {
                extensions.push((
                    EXT_SIGNATURE_ALGORITHMS,
                    encode_u16_list(&shape.signature_algorithms),
                ));
            }
            ExtensionId::SignedCertificateTimestamp => {
                extensions.push((EXT_SCT, Vec::new()));
            }
            ExtensionId::KeyShare => {
                let public = params.key_share_public.ok_or_else(|| {
                    Error::new(ErrorKind::InvalidInput, "missing key share for TLS 1.3 hello")
                })?;
                let mut entries = Vec::new();
                // GREASE key share ahead of the real one.
                put_u16(&mut entries, grease_value(rng));
                put_u16(&mut entries, 1);
                entries.push(0x00);
                put_u16(&mut entries, GROUP_X25519);
                put_u16(&mut entries, 32);
                entries.extend_from_slice(public);

                let mut payload = Vec::with_capacity(entries.len() + 2);
                put_u16(&mut payload, entries.len() as u16);
                payload.extend_from_slice(&entries);
                extensions.push((EXT_KEY_SHARE, payload));
            }
            ExtensionId::PskKeyExchangeModes => {
                extensions.push((EXT_PSK_KEY_EXCHANGE_MODES, vec![0x01, 0x01]));
            }
            ExtensionId::SupportedVersions => {
                let mut versions = vec![grease_value(rng), 0x0304, 0x0303];
                if !shape.offer_tls13 {
                    versions = vec![0x0303];
                }
                let mut payload = Vec::with_capacity(versions.len() * 2 + 1);
                payload.push((versions.len() * 2) as u8);
                for version in versions {
                    put_u16(&mut payload, version);
                }
                extensions.push((EXT_SUPPORTED_VERSIONS, payload));
            }
            ExtensionId::RecordSizeLimit => {
                extensions.push((EXT_RECORD_SIZE_LIMIT, vec![0x40, 0x01]));
            }
            ExtensionId::Padding => {
                has_padding = true;
            }
        }
    }

    let cipher_suites = replace_grease(&shape.cipher_suites, rng);

    // Body without the extensions block, to size padding.
    let mut body = Vec::with_capacity(512);
    put_u16(&mut body, 0x0303); // legacy_version
    body.extend_from_slice(&params.random);
    body.push(params.session_id.len() as u8);
    body.extend_from_slice(&params.session_id);
    put_u16(&mut body, (cipher_suites.len() * 2) as u16);
    for suite in &cipher_suites {
        put_u16(&mut body, *suite);
    }
    body.extend_from_slice(&[0x01, 0x00]); // null compression

    let extensions_wire_len = |extensions: &[(u16, Vec<u8>)]| -> usize {
        extensions.iter().map(|(_, p)| 4 + p.len()).sum()
    };

    if let Some(padding_len) = params.padding_override {
        // Explicit padding directive replaces any template padding and
        // goes to the front of the extension list.
        let padding_len = padding_len.min(65535);
        extensions.insert(0, (EXT_PADDING, vec![0u8; padding_len]));
    } else if has_padding {
        // BoringSSL-style: pad the whole handshake message to a 512-byte
        // boundary when a padding slot is in the template.
        let unpadded = 4 + body.len() + 2 + extensions_wire_len(&extensions) + 4;
        let padding_len = (512 - (unpadded % 512)) % 512;
        extensions.push((EXT_PADDING, vec![0u8; padding_len]));
    }

    let mut extension_bytes = Vec::with_capacity(extensions_wire_len(&extensions));
    for (id, payload) in &extensions {
        put_u16(&mut extension_bytes, *id);
        put_u16(&mut extension_bytes, payload.len() as u16);
        extension_bytes.extend_from_slice(payload);
    }

    put_u16(&mut body, extension_bytes.len() as u16);
    body.extend_from_slice(&extension_bytes);

    let mut message = Vec::with_capacity(body.len() + 4);
    message.push(0x01); // ClientHello
    message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    message.extend_from_slice(&body);
    Ok(message)
}

/// Fields of a parsed ServerHello.
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    /// True when supported_versions negotiates TLS 1.3.
    pub is_tls13: bool,
    pub key_share_x25519: Option<[u8; 32]>,
}

/// The fixed random value signalling a HelloRetryRequest.
const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8,
    0x91, 0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8,
    0x33, 0x9c,
];

/// Parse a ServerHello handshake message (handshake header included).
pub fn parse_server_hello(message: &[u8]) -> Result<ServerHello> {
    let mut reader = BufReader::new(message);
    let message_type = reader.read_u8()?;
    if message_type != 0x02 {
        return Err(Error::new(ErrorKind::InvalidData, "expected ServerHello"));
    }
    let _length = reader.read_u24_be()?;
    let _legacy_version = reader.read_u16_be()?;

    let mut random = [0u8; 32];
    random.copy_from_slice(reader.read_slice(32)?);
    if random == HELLO_RETRY_REQUEST_RANDOM {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "server sent HelloRetryRequest",
        ));
    }

    let session_id_len = reader.read_u8()? as usize;
    let session_id = reader.read_slice(session_id_len)?.to_vec();
    let cipher_suite = reader.read_u16_be()?;
    let _compression = reader.read_u8()?;

    let mut is_tls13 = false;
    let mut key_share_x25519 = None;

    if reader.remaining() > 0 {
        let extensions_len = reader.read_u16_be()? as usize;
        let extensions_end = reader.position() + extensions_len;
        while reader.position() < extensions_end {
            let extension_type = reader.read_u16_be()?;
            let extension_len = reader.read_u16_be()? as usize;
            let payload = reader.read_slice(extension_len)?;
            match extension_type {
                EXT_SUPPORTED_VERSIONS => {
                    if payload.len() == 2 && payload == [0x03, 0x04] {
                        is_tls13 = true;
                    }
                }
                EXT_KEY_SHARE => {
                    let mut share = BufReader::new(payload);
                    let group = share.read_u16_be()?;
                    let key_len = share.read_u16_be()? as usize;
                    if group == GROUP_X25519 && key_len == 32 {
                        let mut key = [0u8; 32];
                        key.copy_from_slice(share.read_slice(32)?);
                        key_share_x25519 = Some(key);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(ServerHello {
        random,
        session_id,
        cipher_suite,
        is_tls13,
        key_share_x25519,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_shape() -> HelloShape {
        HelloShape {
            cipher_suites: vec![GREASE_PLACEHOLDER, 0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f],
            extensions: vec![
                ExtensionId::GreaseFirst,
                ExtensionId::ServerName,
                ExtensionId::ExtendedMasterSecret,
                ExtensionId::SupportedGroups,
                ExtensionId::SessionTicket,
                ExtensionId::Alpn,
                ExtensionId::SignatureAlgorithms,
                ExtensionId::KeyShare,
                ExtensionId::PskKeyExchangeModes,
                ExtensionId::SupportedVersions,
                ExtensionId::GreaseLast,
                ExtensionId::Padding,
            ],
            groups: vec![GREASE_PLACEHOLDER, GROUP_X25519, 0x0017, 0x0018],
            signature_algorithms: vec![0x0403, 0x0804, 0x0401],
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            offer_tls13: true,
            omits_session_tickets: false,
        }
    }

    fn find_extension(hello: &[u8], wanted: u16) -> Option<Vec<u8>> {
        let mut reader = BufReader::new(hello);
        reader.skip(4).unwrap(); // handshake header
        reader.skip(2 + 32).unwrap(); // version + random
        let session_id_len = reader.read_u8().unwrap() as usize;
        reader.skip(session_id_len).unwrap();
        let ciphers_len = reader.read_u16_be().unwrap() as usize;
        reader.skip(ciphers_len).unwrap();
        let compression_len = reader.read_u8().unwrap() as usize;
        reader.skip(compression_len).unwrap();
        let extensions_len = reader.read_u16_be().unwrap() as usize;
        let end = reader.position() + extensions_len;
        while reader.position() < end {
            let id = reader.read_u16_be().unwrap();
            let len = reader.read_u16_be().unwrap() as usize;
            let payload = reader.read_slice(len).unwrap();
            if id == wanted {
                return Some(payload.to_vec());
            }
        }
        None
    }

    fn default_params<'a>(key_share: &'a [u8; 32]) -> HelloParams<'a> {
        HelloParams {
            random: [0x42; 32],
            session_id: vec![0x11; 32],
            server_name: Some("example.com"),
            session_ticket: None,
            key_share_public: Some(key_share),
            padding_override: None,
        }
    }

    #[test]
    fn test_build_carries_random_and_sni() {
        let key_share = [0x24u8; 32];
        let mut rng = StdRng::from_seed([7u8; 32]);
        let hello = build_client_hello(&test_shape(), &default_params(&key_share), &mut rng).unwrap();

        // Random at fixed offset 6.
        assert_eq!(&hello[6..38], &[0x42u8; 32]);

        let sni = find_extension(&hello, EXT_SERVER_NAME).unwrap();
        assert!(sni.ends_with(b"example.com"));
    }

    #[test]
    fn test_sni_omitted() {
        let key_share = [0x24u8; 32];
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut params = default_params(&key_share);
        params.server_name = None;
        let hello = build_client_hello(&test_shape(), &params, &mut rng).unwrap();
        assert!(find_extension(&hello, EXT_SERVER_NAME).is_none());
    }

    #[test]
    fn test_padding_override_at_front() {
        let key_share = [0x24u8; 32];
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut params = default_params(&key_share);
        params.padding_override = Some(300);
        let hello = build_client_hello(&test_shape(), &params, &mut rng).unwrap();

        let padding = find_extension(&hello, EXT_PADDING).unwrap();
        assert_eq!(padding.len(), 300);

        // First extension in the list is the padding extension.
        let mut reader = BufReader::new(&hello);
        reader.skip(4 + 2 + 32).unwrap();
        let session_id_len = reader.read_u8().unwrap() as usize;
        reader.skip(session_id_len).unwrap();
        let ciphers_len = reader.read_u16_be().unwrap() as usize;
        reader.skip(ciphers_len).unwrap();
        reader.skip(2).unwrap(); // compression
        reader.skip(2).unwrap(); // extensions length
        assert_eq!(reader.read_u16_be().unwrap(), EXT_PADDING);
    }

    #[test]
    fn test_template_padding_rounds_to_512() {
        let key_share = [0x24u8; 32];
        let mut rng = StdRng::from_seed([7u8; 32]);
        let hello = build_client_hello(&test_shape(), &default_params(&key_share), &mut rng).unwrap();
        assert_eq!(hello.len() % 512, 0);
    }

    #[test]
    fn test_session_ticket_injected() {
        let key_share = [0x24u8; 32];
        let ticket = vec![0xaa; 128];
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut params = default_params(&key_share);
        params.session_ticket = Some(&ticket);
        let hello = build_client_hello(&test_shape(), &params, &mut rng).unwrap();
        assert_eq!(find_extension(&hello, EXT_SESSION_TICKET).unwrap(), ticket);
    }

    #[test]
    fn test_blank_session_id() {
        let key_share = [0x24u8; 32];
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut params = default_params(&key_share);
        params.session_id = Vec::new();
        let hello = build_client_hello(&test_shape(), &params, &mut rng).unwrap();
        // session_id length byte directly after the random.
        assert_eq!(hello[38], 0);
    }

    #[test]
    fn test_parse_server_hello_tls13() {
        // Handcrafted minimal TLS 1.3 ServerHello.
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0x5a; 32]);
        body.push(32);
        body.extend_from_slice(&[0x11; 32]);
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(0x00);
        let mut extensions = Vec::new();
        extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);
        extensions.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
        extensions.extend_from_slice(&[0x99; 32]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut message = vec![0x02];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);

        let hello = parse_server_hello(&message).unwrap();
        assert!(hello.is_tls13);
        assert_eq!(hello.cipher_suite, 0x1301);
        assert_eq!(hello.key_share_x25519, Some([0x99u8; 32]));
        assert_eq!(hello.session_id, vec![0x11; 32]);
    }

    #[test]
    fn test_parse_rejects_hello_retry_request() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&HELLO_RETRY_REQUEST_RANDOM);
        body.push(0);
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(0x00);
        body.extend_from_slice(&[0x00, 0x00]);

        let mut message = vec![0x02];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);

        let err = parse_server_hello(&message).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}

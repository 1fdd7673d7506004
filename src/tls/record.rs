//! TLS record protection: TLS 1.3 AEAD records (inner content type,
//! sequence-XOR nonce) and TLS 1.2 AES-GCM records (explicit nonce) for
//! the session-ticket resumption path.

use std::io::{Error, ErrorKind, Result};

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

use super::keys::CipherSuite;

pub const CONTENT_TYPE_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_TYPE_ALERT: u8 = 0x15;
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
pub const CONTENT_TYPE_APPLICATION_DATA: u8 = 0x17;

pub const TLS_RECORD_HEADER_LEN: usize = 5;
pub const MAX_TLS_PLAINTEXT_LEN: usize = 16384;
/// Plaintext + inner type + AEAD tag, with slack for implementations that
/// pad; RFC 8446 allows up to 2^14 + 256 of ciphertext.
pub const MAX_TLS_CIPHERTEXT_LEN: usize = MAX_TLS_PLAINTEXT_LEN + 256;

pub fn record_header(content_type: u8, length: usize) -> [u8; TLS_RECORD_HEADER_LEN] {
    let length = length as u16;
    [
        content_type,
        0x03,
        0x03,
        (length >> 8) as u8,
        length as u8,
    ]
}

fn new_key(suite: CipherSuite, key: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(suite.aead_algorithm(), key)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid AEAD key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn xor_nonce(iv: &[u8], sequence: u64) -> Result<Nonce> {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(iv);
    for (i, byte) in sequence.to_be_bytes().iter().enumerate() {
        nonce[4 + i] ^= byte;
    }
    Nonce::try_assume_unique_for_key(&nonce)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid nonce"))
}

/// One direction of TLS 1.3 record protection.
pub struct Tls13RecordCodec {
    suite: CipherSuite,
    key: LessSafeKey,
    iv: Vec<u8>,
    sequence: u64,
}

impl Tls13RecordCodec {
    pub fn new(suite: CipherSuite, key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != 12 {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid IV length"));
        }
        Ok(Self {
            suite,
            key: new_key(suite, key)?,
            iv: iv.to_vec(),
            sequence: 0,
        })
    }

    /// Install new key material (KeyUpdate); resets the sequence number.
    pub fn rekey(&mut self, key: &[u8], iv: &[u8]) -> Result<()> {
        self.key = new_key(self.suite, key)?;
        self.iv = iv.to_vec();
        self.sequence = 0;
        Ok(())
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Produce a full record (header included) protecting `payload` with
    /// the given inner content type.
    pub fn seal(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_TLS_PLAINTEXT_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "record payload too large"));
        }

        let mut inner = Vec::with_capacity(payload.len() + 1 + 16);
        inner.extend_from_slice(payload);
        inner.push(content_type);

        let ciphertext_len = inner.len() + 16;
        let header = record_header(CONTENT_TYPE_APPLICATION_DATA, ciphertext_len);

        let nonce = xor_nonce(&self.iv, self.sequence)?;
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(&header), &mut inner)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "record encryption failed"))?;
        self.sequence = self
            .sequence
            .checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::Other, "record sequence exhausted"))?;

        let mut record = Vec::with_capacity(TLS_RECORD_HEADER_LEN + inner.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&inner);
        Ok(record)
    }

    /// Open one record body; returns (inner content type, plaintext).
    /// Trailing zero padding before the content type byte is removed.
    pub fn open(&mut self, header: &[u8; TLS_RECORD_HEADER_LEN], body: &[u8]) -> Result<(u8, Vec<u8>)> {
        if body.len() > MAX_TLS_CIPHERTEXT_LEN + 16 {
            return Err(Error::new(ErrorKind::InvalidData, "record too large"));
        }

        let nonce = xor_nonce(&self.iv, self.sequence)?;
        let mut buffer = body.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::from(header), &mut buffer)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "record decryption failed"))?
            .len();
        buffer.truncate(plaintext_len);
        self.sequence = self
            .sequence
            .checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::Other, "record sequence exhausted"))?;

        // Strip padding: zeros after the content, then the type byte.
        while let Some(&last) = buffer.last() {
            if last != 0 {
                break;
            }
            buffer.pop();
        }
        let content_type = buffer.pop().ok_or_else(|| {
            Error::new(ErrorKind::InvalidData, "record contained only padding")
        })?;
        Ok((content_type, buffer))
    }
}

/// One direction of TLS 1.2 AES-128-GCM record protection
/// (client_write or server_write keys from the resumption key block).
pub struct Tls12GcmCodec {
    key: LessSafeKey,
    implicit_iv: [u8; 4],
    sequence: u64,
}

impl Tls12GcmCodec {
    pub fn new(key: &[u8], implicit_iv: &[u8]) -> Result<Self> {
        if implicit_iv.len() != 4 {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid implicit IV"));
        }
        let unbound = UnboundKey::new(&AES_128_GCM, key)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid AEAD key"))?;
        let mut iv = [0u8; 4];
        iv.copy_from_slice(implicit_iv);
        Ok(Self {
            key: LessSafeKey::new(unbound),
            implicit_iv: iv,
            sequence: 0,
        })
    }

    fn nonce(&self, explicit: &[u8; 8]) -> Result<Nonce> {
        let mut nonce = [0u8; 12];
        nonce[0..4].copy_from_slice(&self.implicit_iv);
        nonce[4..12].copy_from_slice(explicit);
        Nonce::try_assume_unique_for_key(&nonce)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid nonce"))
    }

    fn additional_data(&self, content_type: u8, length: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[0..8].copy_from_slice(&self.sequence.to_be_bytes());
        aad[8] = content_type;
        aad[9] = 0x03;
        aad[10] = 0x03;
        aad[11..13].copy_from_slice(&(length as u16).to_be_bytes());
        aad
    }

    /// Produce a full record; the explicit nonce is the sequence number.
    pub fn seal(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_TLS_PLAINTEXT_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "record payload too large"));
        }

        let explicit = self.sequence.to_be_bytes();
        let nonce = self.nonce(&explicit)?;
        let aad = self.additional_data(content_type, payload.len());

        let mut buffer = payload.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(&aad), &mut buffer)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "record encryption failed"))?;
        self.sequence = self
            .sequence
            .checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::Other, "record sequence exhausted"))?;

        let mut record = Vec::with_capacity(TLS_RECORD_HEADER_LEN + 8 + buffer.len());
        record.extend_from_slice(&record_header(content_type, 8 + buffer.len()));
        record.extend_from_slice(&explicit);
        record.extend_from_slice(&buffer);
        Ok(record)
    }

    /// Open one record body (explicit nonce prefix included).
    pub fn open(&mut self, content_type: u8, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < 8 + 16 {
            return Err(Error::new(ErrorKind::InvalidData, "record too short"));
        }
        let mut explicit = [0u8; 8];
        explicit.copy_from_slice(&body[0..8]);
        let nonce = self.nonce(&explicit)?;

        let mut buffer = body[8..].to_vec();
        let aad = self.additional_data(content_type, buffer.len() - 16);
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::from(&aad), &mut buffer)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "record decryption failed"))?
            .len();
        buffer.truncate(plaintext_len);
        self.sequence = self
            .sequence
            .checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::Other, "record sequence exhausted"))?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls13_round_trip() {
        let key = [0x42u8; 16];
        let iv = [0x17u8; 12];
        let mut sealer = Tls13RecordCodec::new(CipherSuite::Aes128GcmSha256, &key, &iv).unwrap();
        let mut opener = Tls13RecordCodec::new(CipherSuite::Aes128GcmSha256, &key, &iv).unwrap();

        for payload in [&b"hello"[..], &[0u8; 600][..]] {
            let record = sealer.seal(CONTENT_TYPE_APPLICATION_DATA, payload).unwrap();
            let mut header = [0u8; TLS_RECORD_HEADER_LEN];
            header.copy_from_slice(&record[0..TLS_RECORD_HEADER_LEN]);
            assert_eq!(header[0], CONTENT_TYPE_APPLICATION_DATA);
            let (content_type, plaintext) =
                opener.open(&header, &record[TLS_RECORD_HEADER_LEN..]).unwrap();
            assert_eq!(content_type, CONTENT_TYPE_APPLICATION_DATA);
            assert_eq!(plaintext, payload);
        }
    }

    #[test]
    fn test_tls13_tamper_detected() {
        let key = [0x42u8; 16];
        let iv = [0x17u8; 12];
        let mut sealer = Tls13RecordCodec::new(CipherSuite::Aes128GcmSha256, &key, &iv).unwrap();
        let mut opener = Tls13RecordCodec::new(CipherSuite::Aes128GcmSha256, &key, &iv).unwrap();

        let mut record = sealer.seal(CONTENT_TYPE_HANDSHAKE, b"finished").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;
        let mut header = [0u8; TLS_RECORD_HEADER_LEN];
        header.copy_from_slice(&record[0..TLS_RECORD_HEADER_LEN]);
        assert!(opener.open(&header, &record[TLS_RECORD_HEADER_LEN..]).is_err());
    }

    #[test]
    fn test_tls13_sequence_mismatch_fails() {
        let key = [0x42u8; 16];
        let iv = [0x17u8; 12];
        let mut sealer = Tls13RecordCodec::new(CipherSuite::Aes128GcmSha256, &key, &iv).unwrap();
        let mut opener = Tls13RecordCodec::new(CipherSuite::Aes128GcmSha256, &key, &iv).unwrap();

        let first = sealer.seal(CONTENT_TYPE_APPLICATION_DATA, b"one").unwrap();
        let second = sealer.seal(CONTENT_TYPE_APPLICATION_DATA, b"two").unwrap();
        let mut header = [0u8; TLS_RECORD_HEADER_LEN];
        header.copy_from_slice(&second[0..TLS_RECORD_HEADER_LEN]);
        // Opening the second record first (wrong sequence) must fail, and
        // the failure must not consume a sequence number.
        assert!(opener.open(&header, &second[TLS_RECORD_HEADER_LEN..]).is_err());
        let mut header = [0u8; TLS_RECORD_HEADER_LEN];
        header.copy_from_slice(&first[0..TLS_RECORD_HEADER_LEN]);
        assert!(opener.open(&header, &first[TLS_RECORD_HEADER_LEN..]).is_ok());
        // Replaying the first record must then fail.
        assert!(opener.open(&header, &first[TLS_RECORD_HEADER_LEN..]).is_err());
    }

    #[test]
    fn test_tls12_round_trip() {
        let key = [0x24u8; 16];
        let iv = [1, 2, 3, 4];
        let mut client = Tls12GcmCodec::new(&key, &iv).unwrap();
        let mut server = Tls12GcmCodec::new(&key, &iv).unwrap();

        let record = client.seal(CONTENT_TYPE_APPLICATION_DATA, b"payload").unwrap();
        assert_eq!(record[0], CONTENT_TYPE_APPLICATION_DATA);
        let plaintext = server
            .open(CONTENT_TYPE_APPLICATION_DATA, &record[TLS_RECORD_HEADER_LEN..])
            .unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn test_tls12_wrong_type_fails() {
        let key = [0x24u8; 16];
        let iv = [1, 2, 3, 4];
        let mut client = Tls12GcmCodec::new(&key, &iv).unwrap();
        let mut server = Tls12GcmCodec::new(&key, &iv).unwrap();

        let record = client.seal(CONTENT_TYPE_HANDSHAKE, b"finished").unwrap();
        // AAD binds the content type.
        assert!(server
            .open(CONTENT_TYPE_APPLICATION_DATA, &record[TLS_RECORD_HEADER_LEN..])
            .is_err());
    }
}

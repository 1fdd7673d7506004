//! Obfuscated session tickets.
//!
//! The client fabricates a session ticket and matching TLS 1.2 session
//! state from a shared 32-byte key. Offering the ticket makes the
//! ClientHello look like an ordinary session resumption, and a server
//! holding the same key can open the ticket, recover the master secret,
//! and complete an abbreviated handshake in which it never sends its
//! certificate.
//!
//! Ticket layout: key_name(16) || iv(16) || AES-256-CBC(state) ||
//! HMAC-SHA256(key_name || iv || ciphertext)[..32]. All three working keys
//! are derived from the shared key, so no per-ticket state is exchanged.

use std::io::{Error, ErrorKind, Result};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use aws_lc_rs::hmac;
use rand::RngCore;

pub const OBFUSCATED_SESSION_TICKET_KEY_LEN: usize = 32;

/// The TLS 1.2 cipher suite the synthetic session claims:
/// TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256.
pub const OBFUSCATED_SESSION_CIPHER_SUITE: u16 = 0xc02f;

const MASTER_SECRET_LEN: usize = 48;
const KEY_NAME_LEN: usize = 16;
const CBC_BLOCK_LEN: usize = 16;

/// Synthetic session state backing an obfuscated ticket.
pub struct ObfuscatedSessionState {
    pub vers: u16,
    pub cipher_suite: u16,
    pub master_secret: [u8; MASTER_SECRET_LEN],
    pub ticket: Vec<u8>,
}

pub fn decode_ticket_key(key_hex: &str) -> Result<[u8; OBFUSCATED_SESSION_TICKET_KEY_LEN]> {
    if key_hex.len() != OBFUSCATED_SESSION_TICKET_KEY_LEN * 2 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "invalid obfuscated session key length",
        ));
    }
    let mut key = [0u8; OBFUSCATED_SESSION_TICKET_KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&key_hex[i * 2..i * 2 + 2], 16).map_err(|_| {
            Error::new(ErrorKind::InvalidInput, "invalid obfuscated session key hex")
        })?;
    }
    Ok(key)
}

fn derive_subkey(key: &[u8; OBFUSCATED_SESSION_TICKET_KEY_LEN], label: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, label).as_ref().to_vec()
}

/// PKCS#7-pad and AES-256-CBC encrypt.
fn cbc_encrypt(key: &[u8], iv: &[u8; CBC_BLOCK_LEN], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let pad = CBC_BLOCK_LEN - (plaintext.len() % CBC_BLOCK_LEN);
    let mut padded = plaintext.to_vec();
    padded.resize(plaintext.len() + pad, pad as u8);

    let mut previous = *iv;
    for block in padded.chunks_mut(CBC_BLOCK_LEN) {
        for (byte, prev) in block.iter_mut().zip(previous.iter()) {
            *byte ^= prev;
        }
        let mut array = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut array);
        block.copy_from_slice(&array);
        previous.copy_from_slice(block);
    }
    padded
}

fn serialize_state(vers: u16, cipher_suite: u16, master_secret: &[u8]) -> Vec<u8> {
    let mut state = Vec::with_capacity(6 + master_secret.len());
    state.extend_from_slice(&vers.to_be_bytes());
    state.extend_from_slice(&cipher_suite.to_be_bytes());
    state.extend_from_slice(&(master_secret.len() as u16).to_be_bytes());
    state.extend_from_slice(master_secret);
    state
}

/// Generate a fresh synthetic session state sealed under the shared key.
pub fn new_obfuscated_session_state(key_hex: &str) -> Result<ObfuscatedSessionState> {
    let key = decode_ticket_key(key_hex)?;

    let aes_key = derive_subkey(&key, b"obfuscated-ticket-aes");
    let mac_key = derive_subkey(&key, b"obfuscated-ticket-mac");
    let key_name = &derive_subkey(&key, b"obfuscated-ticket-name")[0..KEY_NAME_LEN];

    let mut master_secret = [0u8; MASTER_SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut master_secret);

    let mut iv = [0u8; CBC_BLOCK_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let state = serialize_state(0x0303, OBFUSCATED_SESSION_CIPHER_SUITE, &master_secret);
    let ciphertext = cbc_encrypt(&aes_key, &iv, &state);

    let mut ticket = Vec::with_capacity(KEY_NAME_LEN + CBC_BLOCK_LEN + ciphertext.len() + 32);
    ticket.extend_from_slice(key_name);
    ticket.extend_from_slice(&iv);
    ticket.extend_from_slice(&ciphertext);

    let mac = hmac::Key::new(hmac::HMAC_SHA256, &mac_key);
    let tag = hmac::sign(&mac, &ticket);
    ticket.extend_from_slice(&tag.as_ref()[0..32]);

    Ok(ObfuscatedSessionState {
        vers: 0x0303,
        cipher_suite: OBFUSCATED_SESSION_CIPHER_SUITE,
        master_secret,
        ticket,
    })
}

//! Passthrough messages prove knowledge of a shared obfuscation key while
//! remaining indistinguishable from 32 random bytes. A server verifies the
//! message before emitting any response at all; replays are tracked in
//! SeedHistory with a one-resend tolerance for legitimate retransmits.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use aws_lc_rs::{constant_time, digest, hmac};
use parking_lot::Mutex;
use rand::RngCore;

use crate::expiring::ExpiringMap;

pub const PASSTHROUGH_MESSAGE_SIZE: usize = 32;
pub const PASSTHROUGH_NONCE_SIZE: usize = 16;

/// Validity window of a passthrough message. Verification accepts the
/// current and the immediately preceding period, so clock skew up to one
/// period is tolerated.
pub const PASSTHROUGH_TIME_PERIOD: Duration = Duration::from_secs(15 * 60);

fn current_period_index() -> u64 {
    let unix_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    unix_seconds / PASSTHROUGH_TIME_PERIOD.as_secs()
}

/// period_key = HMAC-SHA256(SHA-256(obfuscation_key), label || period_index)
fn derive_period_key(obfuscation_key: &str, period_index: u64) -> hmac::Key {
    let master = digest::digest(&digest::SHA256, obfuscation_key.as_bytes());
    let master_key = hmac::Key::new(hmac::HMAC_SHA256, master.as_ref());

    let mut ctx = hmac::Context::with_key(&master_key);
    ctx.update(b"passthrough-time-factor");
    ctx.update(&period_index.to_be_bytes());
    let tag = ctx.sign();

    hmac::Key::new(hmac::HMAC_SHA256, tag.as_ref())
}

fn message_tag(period_key: &hmac::Key, nonce: &[u8]) -> [u8; 16] {
    let tag = hmac::sign(period_key, nonce);
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag.as_ref()[0..16]);
    out
}

/// Make a passthrough message for the current time period:
/// nonce(16) || HMAC-SHA256(period_key, nonce)[..16].
pub fn make_passthrough_message(
    obfuscation_key: &str,
) -> std::io::Result<[u8; PASSTHROUGH_MESSAGE_SIZE]> {
    if obfuscation_key.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "missing obfuscation key",
        ));
    }

    let mut message = [0u8; PASSTHROUGH_MESSAGE_SIZE];
    rand::thread_rng().fill_bytes(&mut message[0..PASSTHROUGH_NONCE_SIZE]);

    let period_key = derive_period_key(obfuscation_key, current_period_index());
    let tag = message_tag(&period_key, &message[0..PASSTHROUGH_NONCE_SIZE]);
    message[PASSTHROUGH_NONCE_SIZE..].copy_from_slice(&tag);

    Ok(message)
}

/// Verify a passthrough message against the current and previous time
/// periods. Returns false for malformed input; never errors, since the
/// caller's only action on failure is a silent drop.
pub fn verify_passthrough_message(obfuscation_key: &str, message: &[u8]) -> bool {
    if obfuscation_key.is_empty() || message.len() != PASSTHROUGH_MESSAGE_SIZE {
        return false;
    }

    let nonce = &message[0..PASSTHROUGH_NONCE_SIZE];
    let received_tag = &message[PASSTHROUGH_NONCE_SIZE..];

    let period_index = current_period_index();
    for index in [period_index, period_index.saturating_sub(1)] {
        let period_key = derive_period_key(obfuscation_key, index);
        let expected = message_tag(&period_key, nonce);
        if constant_time::verify_slices_are_equal(received_tag, &expected).is_ok() {
            return true;
        }
    }

    false
}

/// Outcome of a SeedHistory insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedAddOutcome {
    New,
    /// Exact duplicate from the same client address; allowed once to
    /// accommodate a legitimate retransmission of the first packet.
    ResendAllowed,
    /// Duplicate from a different address, or a second resend. The caller
    /// must drop the packet and log irregular activity.
    Replay { original_addr: SocketAddr },
}

impl SeedAddOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SeedAddOutcome::Replay { .. })
    }
}

struct SeedEntry {
    addr: SocketAddr,
    resent: bool,
}

/// Recently accepted passthrough messages, used for replay detection.
/// Entries expire at twice the message validity window so a message can
/// never be replayed after its own verification window lapses.
pub struct SeedHistory {
    seeds: Mutex<ExpiringMap<Box<[u8]>, SeedEntry>>,
}

impl Default for SeedHistory {
    fn default() -> Self {
        Self::new(PASSTHROUGH_TIME_PERIOD * 2)
    }
}

impl SeedHistory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seeds: Mutex::new(ExpiringMap::new(ttl)),
        }
    }

    /// Insert a seed, returning whether the packet carrying it should be
    /// accepted. In strict mode no resend is tolerated.
    pub fn add_new(&self, strict: bool, client_addr: SocketAddr, seed: &[u8]) -> SeedAddOutcome {
        let mut seeds = self.seeds.lock();

        if let Some(entry) = seeds.get_mut(&Box::from(seed)) {
            if !strict && !entry.resent && entry.addr == client_addr {
                entry.resent = true;
                return SeedAddOutcome::ResendAllowed;
            }
            return SeedAddOutcome::Replay {
                original_addr: entry.addr,
            };
        }

        seeds.insert(
            Box::from(seed),
            SeedEntry {
                addr: client_addr,
                resent: false,
            },
        );
        SeedAddOutcome::New
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_verify_round_trip() {
        let message = make_passthrough_message("test-key").unwrap();
        assert!(verify_passthrough_message("test-key", &message));
    }

    #[test]
    fn test_verify_wrong_key() {
        let message = make_passthrough_message("test-key").unwrap();
        assert!(!verify_passthrough_message("other-key", &message));
    }

    #[test]
    fn test_verify_random_bytes() {
        let mut random = [0u8; PASSTHROUGH_MESSAGE_SIZE];
        rand::thread_rng().fill_bytes(&mut random);
        assert!(!verify_passthrough_message("test-key", &random));
    }

    #[test]
    fn test_verify_malformed() {
        assert!(!verify_passthrough_message("test-key", &[0u8; 16]));
        assert!(!verify_passthrough_message("", &[0u8; 32]));
    }

    #[test]
    fn test_messages_are_unique() {
        let a = make_passthrough_message("test-key").unwrap();
        let b = make_passthrough_message("test-key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seed_history_resend_tolerance() {
        let history = SeedHistory::default();
        let addr: SocketAddr = "10.0.0.1:4433".parse().unwrap();
        let other_addr: SocketAddr = "10.0.0.1:4434".parse().unwrap();

        assert_eq!(history.add_new(false, addr, b"seed-1"), SeedAddOutcome::New);
        assert_eq!(
            history.add_new(false, addr, b"seed-1"),
            SeedAddOutcome::ResendAllowed
        );
        // Only one resend is tolerated.
        assert_eq!(
            history.add_new(false, addr, b"seed-1"),
            SeedAddOutcome::Replay {
                original_addr: addr
            }
        );
        // A different source port is a replay even on the first duplicate.
        assert_eq!(
            history.add_new(false, other_addr, b"seed-2"),
            SeedAddOutcome::New
        );
        assert_eq!(
            history.add_new(false, addr, b"seed-2"),
            SeedAddOutcome::Replay {
                original_addr: other_addr
            }
        );
    }

    #[test]
    fn test_seed_history_strict() {
        let history = SeedHistory::default();
        let addr: SocketAddr = "10.0.0.1:4433".parse().unwrap();
        assert_eq!(history.add_new(true, addr, b"seed-1"), SeedAddOutcome::New);
        assert_eq!(
            history.add_new(true, addr, b"seed-1"),
            SeedAddOutcome::Replay {
                original_addr: addr
            }
        );
    }
}

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use parking_lot::Mutex;

use crate::expiring::ExpiringMap;

/// Fixed-width key for one TCP connection, derived from the 4-tuple. IPv4
/// addresses are embedded in the IPv6-mapped prefix so both families share
/// one key width. In the SYN-ACK context, src is the server side and dst is
/// the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionFingerprint([u8; 36]);

fn widen(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

impl ConnectionFingerprint {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        let mut key = [0u8; 36];
        key[0..16].copy_from_slice(&widen(src_ip));
        key[16..18].copy_from_slice(&src_port.to_be_bytes());
        key[18..34].copy_from_slice(&widen(dst_ip));
        key[34..36].copy_from_slice(&dst_port.to_be_bytes());
        Self(key)
    }

    pub fn from_addrs(local: SocketAddr, peer: SocketAddr) -> Self {
        Self::new(local.ip(), local.port(), peer.ip(), peer.port())
    }
}

/// Opaque data returned by the spec-select callback, handed back to the
/// listener together with the applied spec name.
pub type SelectExtra = Option<Box<dyn Any + Send>>;

pub struct AppliedSpec {
    /// Empty when the select callback chose not to transform.
    pub spec_name: String,
    pub extra: SelectExtra,
}

/// Records which spec was applied to each intercepted SYN-ACK, keyed by
/// connection fingerprint. Entries are consumed exactly once by the accept
/// path and otherwise evicted by TTL, bounding memory when connections never
/// complete their handshake.
pub struct AppliedSpecCache {
    entries: Mutex<ExpiringMap<ConnectionFingerprint, AppliedSpec>>,
}

impl AppliedSpecCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(ExpiringMap::new(ttl)),
        }
    }

    pub fn insert(&self, fingerprint: ConnectionFingerprint, applied: AppliedSpec) {
        self.entries.lock().insert(fingerprint, applied);
    }

    /// Remove and return the record for a connection. Each record can be
    /// consumed only once.
    pub fn consume(&self, fingerprint: &ConnectionFingerprint) -> Option<AppliedSpec> {
        self.entries.lock().remove(fingerprint)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_v4_mapped_matches_v6_form() {
        let v4 = ConnectionFingerprint::new(
            "10.0.0.1".parse().unwrap(),
            443,
            "10.0.0.2".parse().unwrap(),
            5000,
        );
        let mapped = ConnectionFingerprint::new(
            "::ffff:10.0.0.1".parse().unwrap(),
            443,
            "::ffff:10.0.0.2".parse().unwrap(),
            5000,
        );
        assert_eq!(v4, mapped);
    }

    #[test]
    fn test_fingerprint_distinguishes_ports() {
        let a = ConnectionFingerprint::new(
            "10.0.0.1".parse().unwrap(),
            443,
            "10.0.0.2".parse().unwrap(),
            5000,
        );
        let b = ConnectionFingerprint::new(
            "10.0.0.1".parse().unwrap(),
            443,
            "10.0.0.2".parse().unwrap(),
            5001,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_consume_once() {
        let cache = AppliedSpecCache::new(Duration::from_secs(60));
        let fingerprint = ConnectionFingerprint::new(
            "10.0.0.1".parse().unwrap(),
            443,
            "10.0.0.2".parse().unwrap(),
            5000,
        );
        cache.insert(
            fingerprint,
            AppliedSpec {
                spec_name: "noop".to_string(),
                extra: None,
            },
        );
        let applied = cache.consume(&fingerprint).unwrap();
        assert_eq!(applied.spec_name, "noop");
        assert!(cache.consume(&fingerprint).is_none());
    }
}

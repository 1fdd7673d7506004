//! veilwire - obfuscated transport core for a circumvention tunnel.
//!
//! Three pillars, sharing one anti-probing primitive (the passthrough
//! message):
//!
//! - **SYN-ACK packet transformer** ([`packetman`]): a netfilter-queue
//!   driven middlebox that rewrites the first server-to-client packet of
//!   selected TCP connections according to operator specs, recording the
//!   applied spec per connection for the accept path.
//! - **Obfuscated QUIC transport** ([`quic`]): QUIC under a keyed datagram
//!   obfuscation layer with first-packet proof of key knowledge; silent
//!   towards unauthenticated peers, with an optional legacy dialect behind
//!   an internal mux.
//! - **Custom TLS dialer** ([`tls`]): browser-fingerprint ClientHellos with
//!   obfuscated session tickets, SNI policy, pin verification, padding,
//!   and passthrough-random carriage.
//!
//! The embedding application owns configuration, stores, and logging
//! sinks; this crate exposes typed setters and logs through the `log`
//! facade.

mod buf_reader;
mod expiring;
mod socket_util;

pub mod packetman;
pub mod passthrough;
pub mod quic;
pub mod tls;

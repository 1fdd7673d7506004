//! Raw-socket packet injection.
//!
//! Transformed packets are written through raw sockets with headers
//! included, because the intercept queue can only accept or drop the
//! original packet, not replace it with several. Injected packets carry a
//! socket mark that the intercept filter excludes, so they can never loop
//! back into the queue.

use std::io;
use std::net::IpAddr;

/// "PSIP" in ASCII; the mark the intercept filter excludes.
pub const DEFAULT_SOCKET_MARK: u32 = 0x7073_6970;

pub trait PacketInjector: Send + Sync {
    /// Send one raw IP packet toward `destination`. The packet bytes carry
    /// complete IP and TCP headers.
    fn inject(&self, destination: IpAddr, packet: &[u8]) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::RawSocketInjector;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::net::SocketAddr;
    use std::os::fd::AsRawFd;

    use socket2::{Domain, Protocol, Socket, Type};

    pub struct RawSocketInjector {
        ipv4: Socket,
        ipv6: Option<Socket>,
    }

    fn set_ipv6_header_included(socket: &Socket) -> io::Result<()> {
        let enable: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IPV6,
                libc::IPV6_HDRINCL,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl RawSocketInjector {
        /// Open the IPv4 and (policy permitting) IPv6 raw sockets. When
        /// `allow_no_ipv6` is set, an IPv6 socket failure is downgraded to
        /// a warning and injection proceeds IPv4-only.
        pub fn open(socket_mark: u32, allow_no_ipv6: bool) -> io::Result<Self> {
            let ipv4 = Socket::new(
                Domain::IPV4,
                Type::RAW,
                Some(Protocol::from(libc::IPPROTO_RAW)),
            )?;
            ipv4.set_header_included(true)?;
            ipv4.set_mark(socket_mark)?;

            let ipv6 = match Socket::new(
                Domain::IPV6,
                Type::RAW,
                Some(Protocol::from(libc::IPPROTO_RAW)),
            ) {
                Ok(socket) => {
                    // No policy downgrade here: if the socket can be
                    // created, its options must be settable.
                    set_ipv6_header_included(&socket)?;
                    socket.set_mark(socket_mark)?;
                    Some(socket)
                }
                Err(e) if allow_no_ipv6 => {
                    log::warn!("IPv6 raw socket unavailable: {}", e);
                    None
                }
                Err(e) => return Err(e),
            };

            Ok(Self { ipv4, ipv6 })
        }
    }

    impl PacketInjector for RawSocketInjector {
        fn inject(&self, destination: IpAddr, packet: &[u8]) -> io::Result<()> {
            // The destination address (but not port) is required by sendto
            // even with headers included.
            let addr: SocketAddr = SocketAddr::new(destination, 0);
            let socket = match destination {
                IpAddr::V4(_) => &self.ipv4,
                IpAddr::V6(_) => self.ipv6.as_ref().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "no IPv6 raw socket")
                })?,
            };
            let sent = socket.send_to(packet, &addr.into())?;
            if sent != packet.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short raw send: {} of {} bytes", sent, packet.len()),
                ));
            }
            Ok(())
        }
    }
}

/// Stub for platforms without raw-socket injection.
pub struct UnsupportedInjector;

impl PacketInjector for UnsupportedInjector {
    fn inject(&self, _destination: IpAddr, _packet: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "raw packet injection is not supported on this platform",
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records injected packets instead of sending them.
    #[derive(Default)]
    pub struct FakeInjector {
        pub injected: Mutex<Vec<(IpAddr, Vec<u8>)>>,
        pub fail: bool,
    }

    impl PacketInjector for FakeInjector {
        fn inject(&self, destination: IpAddr, packet: &[u8]) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "injection failed"));
            }
            self.injected.lock().push((destination, packet.to_vec()));
            Ok(())
        }
    }
}

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// Create a bound, non-blocking UDP socket suitable for handing to quinn.
///
/// The receive buffer is enlarged so bursts of obfuscated datagrams are not
/// dropped by the kernel before the relay task drains them.
pub fn new_udp_socket(bind_address: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let domain = if bind_address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Best effort; constrained systems may cap this below the requested size.
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);

    socket.set_nonblocking(true)?;
    socket.bind(&bind_address.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_udp_socket_binds() {
        let socket = new_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.port() != 0);
    }
}

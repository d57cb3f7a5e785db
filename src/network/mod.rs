use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// Creates and configures a UDP socket for RTP reception.
///
/// Handles both unicast and multicast addresses. The socket is blocking
/// with a read timeout, so the receive loop can notice stop requests and
/// socket replacement.
pub fn create_udp_socket(
    addr: SocketAddr,
    receive_buffer: usize,
    read_timeout: Duration,
) -> std::io::Result<UdpSocket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "only IPv4 is supported",
            ));
        }
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // The watchdog rebinds the same port while the old socket may still be draining
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(receive_buffer)?;
    socket.bind(&addr.into())?;

    // Join multicast group if the address is multicast
    if ip.is_multicast() {
        let iface = Ipv4Addr::UNSPECIFIED; // default interface
        socket.join_multicast_v4(&ip, &iface)?;
    }

    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_loopback_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let socket =
            create_udp_socket(addr, 256 * 1024, Duration::from_millis(20)).expect("socket");
        assert_ne!(socket.local_addr().expect("local addr").port(), 0);

        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).expect_err("nothing was sent");
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn rejects_ipv6() {
        let addr: SocketAddr = "[::1]:0".parse().expect("addr");
        assert!(create_udp_socket(addr, 4096, Duration::from_millis(20)).is_err());
    }
}

//! Non-blocking UDP endpoint.
//!
//! Replies always go to the peer's IP on a fixed reply port: game clients
//! send from ephemeral ports that change between episodes but listen on a
//! well-known one.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Largest datagram we accept. STATE packets are ~6 KB but the buffer is a
/// full UDP payload so oversized garbage is drained rather than truncated.
const MAX_DATAGRAM: usize = 65_536;

/// Kernel receive buffer. Multiple game instances burst STATE packets
/// faster than one inference cycle can drain them.
const RECV_BUFFER_BYTES: usize = 16 * 1024 * 1024;

pub struct UdpEndpoint {
    socket: UdpSocket,
    send_port: u16,
    buf: Box<[u8; MAX_DATAGRAM]>,
}

impl UdpEndpoint {
    /// Bind a non-blocking socket on `listen_port` with an enlarged receive
    /// buffer. Replies go out to `send_port`.
    pub fn bind(listen_port: u16, send_port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_BYTES)?;
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port);
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket: UdpSocket = socket.into();
        tracing::info!(
            listen_port,
            send_port,
            rcvbuf = RECV_BUFFER_BYTES,
            "udp endpoint bound"
        );

        Ok(UdpEndpoint {
            socket,
            send_port,
            buf: Box::new([0; MAX_DATAGRAM]),
        })
    }

    /// The port this endpoint actually bound (for tests binding port 0).
    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Drain every immediately available datagram. Returns on `WouldBlock`;
    /// transient peer resets (ICMP port unreachable surfacing on a later
    /// recv) are swallowed.
    pub fn drain(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut packets = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buf[..]) {
                Ok((len, from)) => {
                    packets.push((from, self.buf[..len].to_vec()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "udp recv error");
                    break;
                }
            }
        }
        packets
    }

    /// Send a datagram to `ip` on the fixed reply port. Failures are logged
    /// and dropped; UDP semantics, no retry.
    pub fn send(&self, ip: IpAddr, data: &[u8]) {
        let dest = SocketAddr::new(ip, self.send_port);
        if let Err(e) = self.socket.send_to(data, dest) {
            tracing::warn!(dest = %dest, error = %e, "udp send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_pending_datagrams() {
        let mut server = UdpEndpoint::bind(0, 0).unwrap();
        let server_port = server.local_port().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(b"one", ("127.0.0.1", server_port))
            .unwrap();
        client
            .send_to(b"two", ("127.0.0.1", server_port))
            .unwrap();

        // Give the loopback a moment to deliver.
        let mut packets = Vec::new();
        for _ in 0..50 {
            packets.extend(server.drain());
            if packets.len() >= 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let payloads: Vec<_> = packets.iter().map(|(_, p)| p.as_slice()).collect();
        assert!(payloads.contains(&b"one".as_slice()));
        assert!(payloads.contains(&b"two".as_slice()));
    }

    #[test]
    fn empty_drain_is_empty() {
        let mut server = UdpEndpoint::bind(0, 0).unwrap();
        assert!(server.drain().is_empty());
    }

    #[test]
    fn send_targets_reply_port() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let reply_port = receiver.local_addr().unwrap().port();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();

        let server = UdpEndpoint::bind(0, reply_port).unwrap();
        server.send(IpAddr::V4(Ipv4Addr::LOCALHOST), b"reply");

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"reply");
    }
}

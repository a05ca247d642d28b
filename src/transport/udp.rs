//! UDP transport addressing peers through their advertised websocket `host:port`.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::trace;

use crate::common::PeerDescriptor;

use super::{Transport, TransportError, MAX_THREAD_BLOCK_DURATION};

const MAX_DATAGRAM_SIZE: usize = 65_507;

pub const DEFAULT_PORT: u16 = 7070;

/// A non-blocking [UdpSocket] carrying encoded messages.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Receive buffer, allocated once and reused for every datagram.
    buffer: Box<[u8]>,
}

impl UdpTransport {
    /// Bind to `port`, or to [DEFAULT_PORT] falling back to a random port.
    pub fn bind(port: Option<u16>) -> Result<Self, std::io::Error> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        let local_addr = socket.local_addr()?;

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            local_addr,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    /// Returns the address the socket is listening to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, target: &PeerDescriptor, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::MessageTooLarge(bytes.len()));
        }

        let address = target
            .websocket()
            .and_then(|ws| ws.address().to_socket_addrs().ok())
            .and_then(|mut addresses| addresses.next())
            .ok_or(TransportError::Unreachable(*target.node_id()))?;

        self.socket.send_to(bytes, address)?;

        Ok(())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        match self.socket.recv_from(&mut self.buffer) {
            Ok((amt, from)) => {
                if from.port() == 0 {
                    trace!(context = "transport_validation", "Datagram from port 0");
                    return None;
                }

                Some(self.buffer[..amt].to_vec())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
                None
            }
            Err(e) => {
                trace!(context = "transport_error", ?e, "recv_from failed unexpectedly");
                None
            }
        }
    }

    fn local_port(&self) -> Option<u16> {
        Some(self.local_addr.port())
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use crate::common::{ConnectivityMethod, PeerDescriptor};

    use super::*;

    #[test]
    fn send_and_receive() {
        let mut server = UdpTransport::bind(Some(0)).unwrap();
        let mut client = UdpTransport::bind(Some(0)).unwrap();

        let target = PeerDescriptor::random().with_websocket(ConnectivityMethod::new(
            "127.0.0.1",
            server.local_addr().port(),
            false,
        ));

        client.send(&target, b"hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            received = server.recv();
        }

        assert_eq!(received.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn shorter_datagram_after_longer_one() {
        let mut server = UdpTransport::bind(Some(0)).unwrap();
        let mut client = UdpTransport::bind(Some(0)).unwrap();

        let target = PeerDescriptor::random().with_websocket(ConnectivityMethod::new(
            "127.0.0.1",
            server.local_addr().port(),
            false,
        ));

        client.send(&target, &[7u8; 2048]).unwrap();
        client.send(&target, b"hi").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < 2 && Instant::now() < deadline {
            received.extend(server.recv());
        }

        assert_eq!(received, vec![vec![7u8; 2048], b"hi".to_vec()]);
    }

    #[test]
    fn unreachable_without_websocket() {
        let mut client = UdpTransport::bind(Some(0)).unwrap();

        assert!(matches!(
            client.send(&PeerDescriptor::random(), b"hello"),
            Err(TransportError::Unreachable(_))
        ));
    }
}

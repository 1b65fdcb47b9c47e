//! Non-blocking UDP socket owned by the dispatcher thread.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use bytes::Bytes;
use tracing::trace;

#[derive(Debug)]
/// A non-blocking UdpSocket that reports a full buffer instead of blocking.
pub(crate) struct DatagramSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    buf: Vec<u8>,
}

impl DatagramSocket {
    pub(crate) fn bind(address: SocketAddr, max_message_size: usize) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(address)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(DatagramSocket {
            socket,
            local_addr,
            // One extra byte to detect oversized datagrams.
            buf: vec![0; max_message_size + 1],
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // === Public Methods ===

    /// Receives one datagram if any is available.
    pub(crate) fn recv_from(&mut self) -> std::io::Result<Option<(Bytes, SocketAddr)>> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((amount, from)) => {
                if amount == self.buf.len() {
                    trace!(
                        context = "socket_validation",
                        ?from,
                        "Dropping oversized datagram"
                    );
                    return Ok(Some((Bytes::new(), from)));
                }

                Ok(Some((Bytes::copy_from_slice(&self.buf[..amount]), from)))
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(None),
            // Windows reports ICMP port unreachable on the next read.
            Err(error) if error.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Writes one datagram, returns `false` if the socket buffer is full.
    pub(crate) fn send_to(&self, bytes: &[u8], address: SocketAddr) -> std::io::Result<bool> {
        match self.socket.send_to(bytes, address) {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(error) => Err(error),
        }
    }
}

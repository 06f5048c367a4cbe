//! The non-blocking send/recv contract that drives both endpoints (§6:
//! `send_to`/`recv_from`, both non-blocking, both IPv4/IPv6-capable).
//!
//! Neither [`crate::server::Server`] nor [`crate::client::Client`] opens a
//! socket itself; the application supplies one through this trait so the
//! core stays testable without a real network.

use core::net::SocketAddr;
use no_std_io2::io;

/// Fire-and-forget datagram send, plus non-blocking receive.
pub trait Transport {
    fn send_to(&mut self, addr: SocketAddr, buf: &[u8]) -> io::Result<()>;

    /// Returns `Ok(None)` if nothing is currently available, mirroring a
    /// non-blocking `recvfrom` that would return `WouldBlock`.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

#[cfg(feature = "std")]
impl Transport for std::net::UdpSocket {
    fn send_to(&mut self, addr: SocketAddr, buf: &[u8]) -> io::Result<()> {
        std::net::UdpSocket::send_to(self, buf, addr)?;
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match std::net::UdpSocket::recv_from(self, buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

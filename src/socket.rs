//! Capability (ii): the datagram socket the engine sends and receives on.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Datagram-socket capability: send, receive with a settable read timeout.
/// Implemented directly for [`UdpSocket`]; tests substitute a
/// loss/delay-simulating decorator (see `tests/common`).
///
/// `Sync` is part of the bound (not just `Send`) because the sender engine
/// shares one socket between its tx and rx tasks via `Arc` (§5: "concurrent
/// `sendto` calls on the same socket are permitted by assumption of the
/// substrate").
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, dur)
    }
}

/// `true` if `err` is a read-timeout (as opposed to some other I/O failure).
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

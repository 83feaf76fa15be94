//! The datagram transport a [`Connection`](super::Connection) drives.
//!
//! [`NetlinkSocket`](super::NetlinkSocket) is the production
//! implementation. The connection only relies on the contract below, so
//! anything that behaves like a non-blocking netlink socket can stand in.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Non-blocking netlink datagram transport.
pub trait Transport: AsRawFd {
    /// Local port id stamped into outgoing requests.
    fn port_id(&self) -> u32;

    /// Send one complete message.
    ///
    /// `ErrorKind::WouldBlock` means the send buffer is full and the same
    /// message should be retried later. Any other error is fatal for that
    /// message.
    fn send(&mut self, msg: &[u8]) -> io::Result<()>;

    /// Receive one datagram (possibly several netlink messages).
    ///
    /// `ErrorKind::WouldBlock` means nothing is queued. `ENOBUFS` means the
    /// receive queue overflowed and datagrams were dropped.
    fn recv(&mut self) -> io::Result<Bytes>;

    /// Wait until a datagram can be received or `timeout` expires.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_readable(self.as_raw_fd(), timeout)
    }

    /// Join a multicast group.
    fn add_membership(&mut self, group: u32) -> io::Result<()> {
        let _ = group;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Leave a multicast group.
    fn drop_membership(&mut self, group: u32) -> io::Result<()> {
        let _ = group;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Wait for `fd` to become readable using poll(2).
///
/// Interrupted waits are resumed with the remaining time.
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout_ms = remaining
            .as_millis()
            .try_into()
            .unwrap_or(libc::c_int::MAX);

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        // SAFETY: pfd is a valid pollfd and nfds is 1.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(err),
            }
        }

        if ret == 0 {
            return Ok(false);
        }

        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        return Ok(true);
    }
}

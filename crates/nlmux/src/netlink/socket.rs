//! Non-blocking netlink socket.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Bytes, BytesMut};
use netlink_sys::{Socket, SocketAddr};

use super::config::{ConnectionConfig, Protocol};
use super::error::Result;
use super::transport::Transport;

/// Non-blocking netlink socket used by [`Connection`](super::Connection).
pub struct NetlinkSocket {
    socket: Socket,
    /// Local port ID (assigned by kernel).
    pid: u32,
    protocol: Protocol,
    recv_len: usize,
}

impl NetlinkSocket {
    /// Open, bind and configure a socket as described by `config`.
    ///
    /// Buffer sizing problems are logged, not returned: the socket is still
    /// usable, it is just more likely to overrun.
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        let mut socket = Socket::new(config.protocol.as_isize())?;

        // Bind to get a port ID
        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        if config.ext_ack {
            // Ignore if not supported
            socket.set_ext_ack(true).ok();
        }

        let fd = socket.as_raw_fd();
        if let Err(e) = set_buffer_sizes(fd, config.socket_buffer_size) {
            tracing::warn!(
                error = %e,
                "failed to set netlink socket buffer size, expect overrun issues"
            );
        }
        verify_buffer_sizes(fd, config.socket_buffer_size);

        for &group in &config.groups {
            socket.add_membership(group)?;
        }

        socket.set_non_blocking(true)?;

        tracing::debug!(pid, protocol = ?config.protocol, "netlink socket opened");

        Ok(Self {
            socket,
            pid,
            protocol: config.protocol,
            recv_len: config.recv_buffer_len,
        })
    }

    /// Get the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl Transport for NetlinkSocket {
    fn port_id(&self) -> u32 {
        self.pid
    }

    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        self.socket.send(msg, 0).map(|_| ())
    }

    fn recv(&mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.recv_len);
        // recv advances buf past the received bytes
        self.socket.recv(&mut buf, 0)?;
        Ok(buf.freeze())
    }

    fn add_membership(&mut self, group: u32) -> io::Result<()> {
        self.socket.add_membership(group)
    }

    fn drop_membership(&mut self, group: u32) -> io::Result<()> {
        self.socket.drop_membership(group)
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn set_buffer_sizes(fd: RawFd, bytes: usize) -> io::Result<()> {
    let value = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    set_sockopt_int(fd, libc::SO_RCVBUF, value)?;
    set_sockopt_int(fd, libc::SO_SNDBUF, value)
}

fn verify_buffer_sizes(fd: RawFd, expected: usize) {
    let checks = [
        (libc::SO_SNDBUF, "tx", "/proc/sys/net/core/wmem_max"),
        (libc::SO_RCVBUF, "rx", "/proc/sys/net/core/rmem_max"),
    ];

    for (opt, dir, knob) in checks {
        match get_sockopt_int(fd, opt) {
            Ok(actual) if (actual.max(0) as usize) < expected => {
                tracing::warn!(
                    actual,
                    expected,
                    "{dir} buffer size is below the requested size, please consider changing {knob}"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cannot read {dir} buffer size");
            }
        }
    }
}

fn set_sockopt_int(fd: RawFd, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: value outlives the call and the length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn get_sockopt_int(fd: RawFd, opt: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len are valid for writes of the advertised size.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

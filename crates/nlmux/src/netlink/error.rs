//! Error types for connection and command operations.

use std::io;

/// Result type for netlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during netlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel answered a request with an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Extended ACK message when the kernel supplied one, otherwise
        /// the libc description of `errno`.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The receive buffer overflowed and datagrams were dropped.
    #[error("buffers overrun")]
    Overrun,

    /// The connection has no open socket.
    #[error("connection not started")]
    NotStarted,

    /// The object is not bound to a connection.
    #[error("not bound to a connection")]
    Detached,

    /// `poll` was entered from inside a dispatch callback.
    #[error("connection poll entered reentrantly")]
    ReentrantPoll,

    /// A wait deadline expired before the exchange completed.
    #[error("timed out waiting for completion")]
    Timeout,
}

impl Error {
    /// Create a kernel error from an errno value as found in `nlmsgerr`
    /// (negative).
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Create a kernel error carrying the extended ACK text.
    pub fn from_errno_with_message(errno: i32, message: impl Into<String>) -> Self {
        Self::Kernel {
            errno: -errno,
            message: message.into(),
        }
    }

    /// Get the errno value if this error maps onto one.
    ///
    /// Overrun reports `ENOBUFS`, which is what the socket raises when the
    /// receive queue overflows.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            Self::Io(e) => e.raw_os_error(),
            Self::Overrun => Some(libc::ENOBUFS),
            _ => None,
        }
    }

    /// Check if this is a receive buffer overrun.
    pub fn is_overrun(&self) -> bool {
        matches!(self, Self::Overrun)
    }

    /// Check if this is a wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if the socket reported it cannot take more data right now.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

//! Connection configuration.
//!
//! ```ignore
//! use nlmux::netlink::{ConnectionConfig, Protocol};
//!
//! let config = ConnectionConfig::new(Protocol::Generic)
//!     .socket_buffer_size(4 * 1024 * 1024)
//!     .group(5);
//! ```

use netlink_sys::protocols;

/// Default kernel socket buffer size requested for both directions.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Default size of the buffer a single datagram is received into.
pub const DEFAULT_RECV_BUFFER_LEN: usize = 32 * 1024;

/// Netlink protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Protocol {
    /// Routing/device hook (ip, tc, etc.)
    Route,
    /// Generic netlink (nl80211 and friends)
    #[default]
    Generic,
    /// Netfilter
    Netfilter,
    /// Kernel connector
    Connector,
    /// Kobject uevent
    KobjectUevent,
}

impl Protocol {
    pub(crate) fn as_isize(self) -> isize {
        match self {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Generic => protocols::NETLINK_GENERIC,
            Protocol::Netfilter => protocols::NETLINK_NETFILTER,
            Protocol::Connector => protocols::NETLINK_CONNECTOR,
            Protocol::KobjectUevent => protocols::NETLINK_KOBJECT_UEVENT,
        }
    }
}

/// Settings applied every time a [`Connection`](super::Connection) opens
/// its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Netlink protocol to open.
    pub protocol: Protocol,
    /// Send and receive buffer size requested from the kernel. The
    /// effective sizes are read back and a warning is logged when the OS
    /// caps them below this value.
    pub socket_buffer_size: usize,
    /// Size of the buffer each datagram is received into.
    pub recv_buffer_len: usize,
    /// Multicast groups joined on start.
    pub groups: Vec<u32>,
    /// Ask the kernel for extended ACK error strings.
    pub ext_ack: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            recv_buffer_len: DEFAULT_RECV_BUFFER_LEN,
            groups: Vec::new(),
            ext_ack: true,
        }
    }
}

impl ConnectionConfig {
    /// Default configuration for the given protocol.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Set the requested kernel socket buffer size.
    pub fn socket_buffer_size(mut self, bytes: usize) -> Self {
        self.socket_buffer_size = bytes;
        self
    }

    /// Set the per-datagram receive buffer size.
    pub fn recv_buffer_len(mut self, bytes: usize) -> Self {
        self.recv_buffer_len = bytes;
        self
    }

    /// Join a multicast group on start.
    pub fn group(mut self, group: u32) -> Self {
        if !self.groups.contains(&group) {
            self.groups.push(group);
        }
        self
    }

    /// Enable or disable extended ACK reporting.
    pub fn ext_ack(mut self, enable: bool) -> Self {
        self.ext_ack = enable;
        self
    }
}

//! Common test utilities for integration tests.

use std::process::Command as Process;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};

use nlmux::netlink::{Connection, ConnectionConfig, Message, MessageBuilder, NlMsgType, Protocol};

/// Size of `struct ifinfomsg`.
pub const IFINFOMSG_LEN: usize = 16;

/// RTM_NEWLINK, the reply type of RTM_GETLINK.
pub const RTM_NEWLINK: u16 = 16;

/// Multicast group for link notifications.
pub const RTNLGRP_LINK: u32 = 1;

static TRACING: Once = Once::new();
static LINK_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Install a log subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A started route connection.
pub fn route_connection(config: ConnectionConfig) -> Connection {
    init_tracing();
    let conn = Connection::new(ConnectionConfig {
        protocol: Protocol::Route,
        ..config
    });
    conn.start().expect("failed to open NETLINK_ROUTE socket");
    conn
}

/// RTM_GETLINK dump request.
pub fn dump_links() -> Message {
    let mut b = MessageBuilder::dump(NlMsgType::RTM_GETLINK);
    b.append_bytes(&[0u8; IFINFOMSG_LEN]);
    b.into()
}

/// RTM_GETLINK request for a single interface index.
pub fn get_link(index: i32) -> Message {
    let mut ifinfo = [0u8; IFINFOMSG_LEN];
    ifinfo[4..8].copy_from_slice(&index.to_ne_bytes());

    let mut b = MessageBuilder::request(NlMsgType::RTM_GETLINK);
    b.append_bytes(&ifinfo);
    b.into()
}

/// A dummy interface that is deleted on drop.
pub struct DummyLink {
    name: String,
}

impl DummyLink {
    pub fn create() -> std::io::Result<Self> {
        let id = LINK_COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("nlmux{}d{}", std::process::id() % 10000, id);

        let status = Process::new("ip")
            .args(["link", "add", &name, "type", "dummy"])
            .status()?;
        if !status.success() {
            return Err(std::io::Error::other(format!("failed to create {name}")));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DummyLink {
    fn drop(&mut self) {
        let _ = Process::new("ip").args(["link", "del", &self.name]).status();
    }
}

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test if not running as root.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return;
        }
    };
}

//! Netlink command/connection multiplexing.
//!
//! One [`Connection`] owns one netlink socket. Any number of [`Command`]s
//! share it for request/response exchanges, sent strictly one at a time in
//! the order they were queued, and any number of [`Subscription`]s listen
//! to the broadcast messages arriving on it. A [`Block`] holds back sending
//! while the caller reconfigures something.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use nlmux::netlink::{Connection, ConnectionConfig, MessageBuilder, NlMsgType, Protocol};
//!
//! let conn = Connection::new(ConnectionConfig::new(Protocol::Route));
//! conn.start()?;
//!
//! let cmd = conn.alloc_command();
//! cmd.set_response_callback(|msg| println!("link: {:?}", msg));
//! cmd.set_message(Some(MessageBuilder::dump(NlMsgType::RTM_GETLINK).into()));
//! cmd.wait(Duration::from_secs(1))?;
//! ```
//!
//! # Event Monitoring
//!
//! ```ignore
//! use nlmux::netlink::{Connection, ConnectionConfig, Protocol, Subscription};
//!
//! let conn = Connection::new(ConnectionConfig::new(Protocol::Route).group(1));
//! let sub = Subscription::new();
//! sub.set_event_callback(|msg| println!("event: {:?}", msg));
//! sub.set_overrun_callback(|| println!("events lost, resync"));
//! conn.subscribe(&sub);
//! conn.start()?;
//!
//! // with tokio
//! conn.drive().await?;
//! ```

pub mod attr;
mod block;
mod builder;
mod callback;
mod command;
pub mod config;
mod connection;
mod driver;
mod error;
#[cfg(test)]
mod fixtures;
pub mod message;
mod socket;
mod stream;
mod subscription;
pub mod transport;

pub use attr::{AttrIter, NlAttr};
pub use block::Block;
pub use builder::{MessageBuilder, NestToken};
pub use command::Command;
pub use config::{ConnectionConfig, Protocol};
pub use connection::Connection;
pub use error::{Error, Result};
pub use message::{EVENT_SEQ, Message, MessageIter, NLMSG_HDRLEN, NlMsgError, NlMsgHdr, NlMsgType};
pub use socket::NetlinkSocket;
pub use stream::{EventStream, SubscriptionEvent};
pub use subscription::Subscription;
pub use transport::Transport;

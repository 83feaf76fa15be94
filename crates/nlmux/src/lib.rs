//! Netlink command/connection multiplexer for Linux.
//!
//! This crate runs many request/response exchanges and broadcast listeners
//! over a single netlink socket. It is protocol agnostic: route, generic
//! netlink (nl80211 and friends) and the rest all use the same reactor, the
//! caller builds the requests and interprets the replies.
//!
//! - [`Connection`] owns the socket, sends queued commands one at a time and
//!   routes every received message to whoever is waiting for it.
//! - [`Command`](netlink::Command) is one exchange; it reports responses,
//!   failure and completion through callbacks.
//! - [`Subscription`](netlink::Subscription) receives broadcast messages and
//!   is told about socket start, stop and receive buffer overruns.
//! - [`Block`](netlink::Block) suspends sending while held.
//!
//! The reactor is single-threaded and callback driven. Either call
//! [`Connection::poll`] when the socket is readable, block on
//! [`Command::wait`](netlink::Command::wait), or await
//! [`Connection::drive`] on a tokio current-thread runtime.
//!
//! # Features
//!
//! - `serde` - Serialize/Deserialize for [`ConnectionConfig`]
//! - `integration` - Build the integration tests (need NETLINK_ROUTE)
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use nlmux::netlink::{MessageBuilder, NlMsgType};
//! use nlmux::{Connection, ConnectionConfig, Protocol};
//!
//! fn main() -> nlmux::Result<()> {
//!     let conn = Connection::new(ConnectionConfig::new(Protocol::Route));
//!     conn.start()?;
//!
//!     let mut b = MessageBuilder::dump(NlMsgType::RTM_GETLINK);
//!     b.append_bytes(&[0u8; 16]);
//!
//!     let cmd = conn.alloc_command();
//!     cmd.set_response_callback(|msg| println!("{:?}", msg));
//!     cmd.set_failed_callback(|err| eprintln!("dump failed: {}", err));
//!     cmd.set_message(Some(b.into()));
//!     cmd.wait(Duration::from_secs(1))
//! }
//! ```
//!
//! # Event Monitoring
//!
//! ```ignore
//! use nlmux::netlink::{EventStream, SubscriptionEvent};
//! use nlmux::{Connection, ConnectionConfig, Protocol};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> nlmux::Result<()> {
//!     let conn = Connection::new(ConnectionConfig::new(Protocol::Route).group(1));
//!     let mut events = EventStream::new(&conn);
//!     conn.start()?;
//!
//!     let watch = async {
//!         while let Some(event) = events.next().await {
//!             match event {
//!                 SubscriptionEvent::Event(msg) => println!("{:?}", msg),
//!                 SubscriptionEvent::Overrun => println!("events lost, resync"),
//!                 _ => {}
//!             }
//!         }
//!     };
//!
//!     tokio::select! {
//!         result = conn.drive() => result,
//!         () = watch => Ok(()),
//!     }
//! }
//! ```

pub mod netlink;

// Re-export common types at crate root for convenience
pub use netlink::{Connection, ConnectionConfig, Error, Protocol, Result};

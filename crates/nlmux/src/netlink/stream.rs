//! Subscription callbacks as a [`Stream`].
//!
//! ```ignore
//! use nlmux::netlink::{Connection, ConnectionConfig, EventStream, Protocol, SubscriptionEvent};
//! use tokio_stream::StreamExt;
//!
//! let conn = Connection::new(ConnectionConfig::new(Protocol::Route).group(1));
//! let mut events = EventStream::new(&conn);
//! conn.start()?;
//!
//! tokio::select! {
//!     result = conn.drive() => result?,
//!     _ = async {
//!         while let Some(event) = events.next().await {
//!             if let SubscriptionEvent::Event(msg) = event {
//!                 println!("{:?}", msg);
//!             }
//!         }
//!     } => {}
//! }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::connection::Connection;
use super::message::Message;
use super::subscription::Subscription;

/// Something a [`Subscription`] was told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The connection's socket opened.
    Started,
    /// The connection's socket closed.
    Stopped,
    /// Broadcast messages were lost.
    Overrun,
    /// A broadcast message.
    Event(Message),
}

/// A [`Subscription`] that queues what it sees for async consumption.
///
/// Events are only produced while something polls the connection, usually
/// [`Connection::drive`] running alongside. The queue is unbounded.
pub struct EventStream {
    subscription: Subscription,
    events: UnboundedReceiverStream<SubscriptionEvent>,
}

impl EventStream {
    /// Subscribe to `conn`.
    pub fn new(conn: &Connection) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::new();

        let sender = tx.clone();
        subscription.set_started_callback(move || {
            let _ = sender.send(SubscriptionEvent::Started);
        });
        let sender = tx.clone();
        subscription.set_stopped_callback(move || {
            let _ = sender.send(SubscriptionEvent::Stopped);
        });
        let sender = tx.clone();
        subscription.set_overrun_callback(move || {
            let _ = sender.send(SubscriptionEvent::Overrun);
        });
        subscription.set_event_callback(move |msg| {
            let _ = tx.send(SubscriptionEvent::Event(msg.clone()));
        });

        subscription.start(conn);

        Self {
            subscription,
            events: UnboundedReceiverStream::new(rx),
        }
    }

    /// The underlying subscription.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for EventStream {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

//! Subscriptions and the tokio driver against the kernel.

use std::time::Duration;

use nlmux::netlink::{ConnectionConfig, EventStream, SubscriptionEvent};
use tokio_stream::StreamExt;

use crate::common::{DummyLink, RTM_NEWLINK, RTNLGRP_LINK, dump_links, route_connection};

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_drive_dump() {
    let conn = route_connection(ConnectionConfig::default());

    let cmd = conn.alloc_command();
    let stopper = conn.clone();
    cmd.set_completed_callback(move || stopper.stop());
    cmd.set_message(Some(dump_links()));

    tokio::time::timeout(TIMEOUT, conn.drive())
        .await
        .expect("dump did not complete")
        .unwrap();

    assert!(cmd.is_completed());
    assert!(!cmd.has_failed());
}

#[tokio::test]
async fn test_stream_lifecycle() {
    let conn = route_connection(ConnectionConfig::default());
    let mut events = EventStream::new(&conn);

    conn.stop();

    assert_eq!(events.next().await, Some(SubscriptionEvent::Started));
    assert_eq!(events.next().await, Some(SubscriptionEvent::Stopped));
}

#[tokio::test]
async fn test_link_event() {
    require_root!();

    let conn = route_connection(ConnectionConfig::default().group(RTNLGRP_LINK));
    let mut events = EventStream::new(&conn);
    assert_eq!(events.next().await, Some(SubscriptionEvent::Started));

    let link = DummyLink::create().unwrap();

    let watch = async {
        while let Some(event) = events.next().await {
            if let SubscriptionEvent::Event(msg) = event {
                if msg.msg_type() == RTM_NEWLINK {
                    conn.stop();
                    return true;
                }
            }
        }
        false
    };

    let (driven, seen) = tokio::time::timeout(TIMEOUT, async { tokio::join!(conn.drive(), watch) })
        .await
        .expect("no link event");

    driven.unwrap();
    assert!(seen, "no RTM_NEWLINK for {}", link.name());
}

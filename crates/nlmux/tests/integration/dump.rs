//! Request/response exchanges against the kernel.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nlmux::netlink::attr::get;
use nlmux::netlink::{AttrIter, ConnectionConfig, Error};

use crate::common::{IFINFOMSG_LEN, RTM_NEWLINK, dump_links, get_link, route_connection};

const IFLA_IFNAME: u16 = 3;
const TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn test_dump_links() {
    let conn = route_connection(ConnectionConfig::default());
    let names = Rc::new(RefCell::new(Vec::new()));

    let cmd = conn.alloc_command();
    cmd.set_name("dump links");
    let seen = Rc::clone(&names);
    cmd.set_response_callback(move |msg| {
        assert_eq!(msg.msg_type(), RTM_NEWLINK);
        let attrs = AttrIter::new(&msg.payload()[IFINFOMSG_LEN..]);
        for (kind, data) in attrs {
            if kind == IFLA_IFNAME {
                seen.borrow_mut().push(get::string(data).unwrap().to_string());
            }
        }
    });
    cmd.set_message(Some(dump_links()));

    cmd.wait(TIMEOUT).unwrap();

    assert!(!cmd.has_failed());
    assert!(names.borrow().iter().any(|n| n == "lo"));
    assert_eq!(conn.in_flight_len(), 0);
}

#[test]
fn test_error_reply() {
    let conn = route_connection(ConnectionConfig::default());
    let errors = Rc::new(RefCell::new(Vec::new()));
    let completed = Rc::new(RefCell::new(0));

    let cmd = conn.alloc_command();
    let failures = Rc::clone(&errors);
    cmd.set_failed_callback(move |err: &Error| failures.borrow_mut().push(err.errno()));
    let count = Rc::clone(&completed);
    cmd.set_completed_callback(move || *count.borrow_mut() += 1);
    cmd.set_message(Some(get_link(i32::MAX)));

    cmd.wait(TIMEOUT).unwrap();

    assert!(cmd.has_failed());
    assert_eq!(*errors.borrow(), vec![Some(libc::ENODEV)]);
    assert_eq!(*completed.borrow(), 1);
}

#[test]
fn test_dumps_run_in_order() {
    let conn = route_connection(ConnectionConfig::default());
    let order = Rc::new(RefCell::new(Vec::new()));

    let cmds: Vec<_> = (0..3)
        .map(|i| {
            let cmd = conn.alloc_command();
            let done = Rc::clone(&order);
            cmd.set_completed_callback(move || done.borrow_mut().push(i));
            cmd.set_message(Some(dump_links()));
            cmd
        })
        .collect();

    assert_eq!(conn.in_flight_len(), 1);
    assert_eq!(conn.pending_len(), 2);

    cmds[2].wait(TIMEOUT).unwrap();

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
    assert!(cmds.iter().all(|c| !c.has_failed()));
}

#[test]
fn test_replace_in_flight_dump() {
    let conn = route_connection(ConnectionConfig::default());
    let responses = Rc::new(RefCell::new(0usize));

    let cmd = conn.alloc_command();
    let count = Rc::clone(&responses);
    cmd.set_response_callback(move |_| *count.borrow_mut() += 1);

    cmd.set_message(Some(dump_links()));
    let first = conn.in_flight_len();
    cmd.set_message(Some(get_link(1)));
    assert_eq!(first, 1);
    assert!(conn.cancelled_seq().is_some());

    cmd.wait(TIMEOUT).unwrap();

    // only the loopback answer, none of the abandoned dump
    assert_eq!(*responses.borrow(), 1);
    assert!(conn.cancelled_seq().is_none());
    assert!(!conn.is_blocked());
}

#[test]
fn test_block_holds_requests() {
    let conn = route_connection(ConnectionConfig::default());

    let block = conn.acquire_block("test");
    let cmd = conn.alloc_command();
    cmd.set_message(Some(dump_links()));
    assert!(cmd.is_pending());
    assert!(cmd.wait(Duration::from_millis(50)).unwrap_err().is_timeout());

    block.release();
    assert!(cmd.is_in_flight());
    cmd.wait(TIMEOUT).unwrap();
}

#[test]
fn test_restart_keeps_queue() {
    let conn = route_connection(ConnectionConfig::default());
    let fd = conn.raw_fd();
    assert!(fd.is_some());

    let block = conn.acquire_block("restart");
    let cmd = conn.alloc_command();
    cmd.set_message(Some(dump_links()));
    conn.stop();
    assert!(conn.raw_fd().is_none());
    drop(block);

    conn.start().unwrap();
    cmd.wait(TIMEOUT).unwrap();
    assert!(!cmd.has_failed());
}

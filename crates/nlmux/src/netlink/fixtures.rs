//! In-memory kernel used by unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use super::builder::MessageBuilder;
use super::command::Command;
use super::config::ConnectionConfig;
use super::connection::Connection;
use super::message::{
    EVENT_SEQ, Message, NLM_F_MULTI, NLM_F_REQUEST, NlMsgError, NlMsgHdr, NlMsgType,
};
use super::subscription::Subscription;
use super::transport::Transport;

pub(crate) const GET_FOO: u16 = 0x20;
pub(crate) const GET_BAR: u16 = 0x21;

pub(crate) fn request(msg_type: u16) -> Message {
    MessageBuilder::request(msg_type).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendMode {
    Accept,
    Busy,
    /// Fail the next send with the given errno, then accept again.
    FailOnce(i32),
}

struct Kernel {
    mode: SendMode,
    sent: Vec<Message>,
    inbound: VecDeque<io::Result<Vec<u8>>>,
    groups: Vec<u32>,
    opened: usize,
    closed: usize,
    /// One byte per queued datagram, so the mock socket has a real
    /// descriptor that polls readable while `inbound` is non-empty.
    doorbell: UnixStream,
    bell: UnixStream,
}

#[derive(Clone)]
pub(crate) struct MockKernel(Rc<RefCell<Kernel>>);

impl MockKernel {
    pub(crate) const PORT_ID: u32 = 4242;

    pub(crate) fn new() -> Self {
        let (doorbell, bell) = UnixStream::pair().unwrap();
        bell.set_nonblocking(true).unwrap();
        Self(Rc::new(RefCell::new(Kernel {
            mode: SendMode::Accept,
            sent: Vec::new(),
            inbound: VecDeque::new(),
            groups: Vec::new(),
            opened: 0,
            closed: 0,
            doorbell,
            bell,
        })))
    }

    /// A stopped connection whose sockets talk to this kernel.
    pub(crate) fn connection(&self) -> Connection {
        let kernel = self.clone();
        Connection::with_transport(ConnectionConfig::default(), move |_| {
            kernel.0.borrow_mut().opened += 1;
            Ok(Box::new(MockSocket {
                kernel: kernel.clone(),
            }) as Box<dyn Transport>)
        })
    }

    pub(crate) fn started(&self) -> Connection {
        let conn = self.connection();
        conn.start().unwrap();
        conn
    }

    pub(crate) fn set_send_mode(&self, mode: SendMode) {
        self.0.borrow_mut().mode = mode;
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.0.borrow().sent.clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.0.borrow().sent.len()
    }

    pub(crate) fn last_sent(&self) -> Message {
        self.0.borrow().sent.last().cloned().expect("nothing sent")
    }

    pub(crate) fn groups(&self) -> Vec<u32> {
        self.0.borrow().groups.clone()
    }

    pub(crate) fn opened(&self) -> usize {
        self.0.borrow().opened
    }

    pub(crate) fn closed(&self) -> usize {
        self.0.borrow().closed
    }

    pub(crate) fn pending_inbound(&self) -> usize {
        self.0.borrow().inbound.len()
    }

    pub(crate) fn push(&self, datagram: Vec<u8>) {
        self.enqueue(Ok(datagram));
    }

    fn enqueue(&self, datagram: io::Result<Vec<u8>>) {
        let mut kernel = self.0.borrow_mut();
        kernel.inbound.push_back(datagram);
        (&kernel.doorbell).write_all(&[0]).unwrap();
    }

    pub(crate) fn ack(&self, seq: u32) {
        self.error(seq, 0);
    }

    pub(crate) fn error(&self, seq: u32, errno: i32) {
        let mut request = NlMsgHdr::new(NlMsgType::MIN_TYPE, NLM_F_REQUEST);
        request.nlmsg_len = 16;
        request.nlmsg_seq = seq;
        request.nlmsg_pid = Self::PORT_ID;

        let mut b = MessageBuilder::new(NlMsgType::ERROR, 0);
        b.append(&NlMsgError {
            error: errno,
            msg: request,
        });
        b.set_seq(seq);
        self.push(b.finish());
    }

    pub(crate) fn done(&self, seq: u32) {
        let mut b = MessageBuilder::new(NlMsgType::DONE, NLM_F_MULTI);
        b.append(&0i32);
        b.set_seq(seq);
        self.push(b.finish());
    }

    pub(crate) fn data(&self, seq: u32, msg_type: u16) {
        let mut b = MessageBuilder::new(msg_type, NLM_F_MULTI);
        b.append_attr_u32(1, seq);
        b.set_seq(seq);
        self.push(b.finish());
    }

    pub(crate) fn event(&self, msg_type: u16) {
        let mut b = MessageBuilder::new(msg_type, 0);
        b.append_attr_str(1, "eth0");
        b.set_seq(EVENT_SEQ);
        self.push(b.finish());
    }

    /// Queue an `ENOBUFS` receive error.
    pub(crate) fn overrun(&self) {
        self.enqueue(Err(io::Error::from_raw_os_error(libc::ENOBUFS)));
    }

    /// Queue an explicit NLMSG_OVERRUN message.
    pub(crate) fn overrun_message(&self) {
        self.push(MessageBuilder::new(NlMsgType::OVERRUN, 0).finish());
    }
}

struct MockSocket {
    kernel: MockKernel,
}

impl Transport for MockSocket {
    fn port_id(&self) -> u32 {
        MockKernel::PORT_ID
    }

    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let mut kernel = self.kernel.0.borrow_mut();
        match kernel.mode {
            SendMode::Accept => {
                let msg = Message::from_bytes(msg.to_vec()).expect("malformed request");
                kernel.sent.push(msg);
                Ok(())
            }
            SendMode::Busy => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            SendMode::FailOnce(errno) => {
                kernel.mode = SendMode::Accept;
                Err(io::Error::from_raw_os_error(errno))
            }
        }
    }

    fn recv(&mut self) -> io::Result<Bytes> {
        let mut kernel = self.kernel.0.borrow_mut();
        match kernel.inbound.pop_front() {
            Some(datagram) => {
                (&kernel.bell).read_exact(&mut [0u8; 1])?;
                datagram.map(Bytes::from)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn wait_readable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(!self.kernel.0.borrow().inbound.is_empty())
    }

    fn add_membership(&mut self, group: u32) -> io::Result<()> {
        self.kernel.0.borrow_mut().groups.push(group);
        Ok(())
    }

    fn drop_membership(&mut self, group: u32) -> io::Result<()> {
        self.kernel.0.borrow_mut().groups.retain(|&g| g != group);
        Ok(())
    }
}

impl AsRawFd for MockSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.kernel.0.borrow().bell.as_raw_fd()
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.kernel.0.borrow_mut().closed += 1;
    }
}

/// Collects callback invocations as readable strings.
#[derive(Clone, Default)]
pub(crate) struct Recorder(Rc<RefCell<Vec<String>>>);

impl Recorder {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub(crate) fn watch(&self, cmd: &Command, label: &str) {
        let (log, name) = (self.clone(), label.to_string());
        cmd.set_response_callback(move |msg| log.push(format!("{name}:response:{}", msg.msg_type())));
        let (log, name) = (self.clone(), label.to_string());
        cmd.set_completed_callback(move || log.push(format!("{name}:completed")));
        let (log, name) = (self.clone(), label.to_string());
        cmd.set_failed_callback(move |err| log.push(format!("{name}:failed:{err}")));
    }

    pub(crate) fn watch_subscription(&self, sub: &Subscription, label: &str) {
        let (log, name) = (self.clone(), label.to_string());
        sub.set_started_callback(move || log.push(format!("{name}:started")));
        let (log, name) = (self.clone(), label.to_string());
        sub.set_stopped_callback(move || log.push(format!("{name}:stopped")));
        let (log, name) = (self.clone(), label.to_string());
        sub.set_overrun_callback(move || log.push(format!("{name}:overrun")));
        let (log, name) = (self.clone(), label.to_string());
        sub.set_event_callback(move |msg| log.push(format!("{name}:event:{}", msg.msg_type())));
    }
}

//! Netlink message header and framing.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::attr::{AttrIter, get};
use super::builder::MessageBuilder;
use super::error::{Error, Result};

/// Netlink message header alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Sequence number carried by unsolicited (multicast) messages.
pub const EVENT_SEQ: u32 = 0;

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nlmsg_len as usize).saturating_sub(NLMSG_HDRLEN)
    }

    /// Check if this is an error message (or ACK).
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NlMsgType::ERROR
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NlMsgType::DONE
    }

    /// Check if this message has the multi flag.
    pub fn is_multi(&self) -> bool {
        self.nlmsg_flags & NLM_F_MULTI != 0
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from bytes.
    ///
    /// The header is copied out, so `data` needs no particular alignment.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(h, _)| h)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Standard netlink message types.
pub struct NlMsgType;

impl NlMsgType {
    /// No operation, message must be discarded.
    pub const NOOP: u16 = 1;
    /// Error message or ACK.
    pub const ERROR: u16 = 2;
    /// End of multipart message.
    pub const DONE: u16 = 3;
    /// Data lost, request resend.
    pub const OVERRUN: u16 = 4;
    /// First type value available to protocol messages.
    pub const MIN_TYPE: u16 = 0x10;

    /// RTNetlink link dump/get request.
    pub const RTM_GETLINK: u16 = 18;
}

/// Netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;

// Modifiers to GET request
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Flags for ACK messages
pub const NLM_F_CAPPED: u16 = 0x100;
pub const NLM_F_ACK_TLVS: u16 = 0x200;

/// Extended ACK attribute carrying a human readable error string.
pub const NLMSGERR_ATTR_MSG: u16 = 1;

/// Iterator over netlink messages in a datagram.
///
/// Yields the copied header together with the whole message slice
/// (header included); the payload starts at [`NLMSG_HDRLEN`].
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Create a new message iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            // Nothing after a corrupt length can be trusted.
            self.data = &[];
            return Some(Err(Error::InvalidMessage(format!(
                "invalid message length: {}",
                msg_len
            ))));
        }

        let msg = &self.data[..msg_len];
        let aligned_len = nlmsg_align(msg_len);

        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some(Ok((header, msg)))
    }
}

/// Netlink error message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno or 0 for ACK).
    pub error: i32,
    /// Original message header that caused the error.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse error message from payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }

    /// Check if this is an ACK (no error).
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }

    /// Extract the extended ACK error string, if the kernel attached one.
    ///
    /// `flags` are the flags of the NLMSG_ERROR header and `payload` is its
    /// full payload. Unless `NLM_F_CAPPED` is set the original request is
    /// echoed in full before the TLVs.
    pub fn ext_ack_message(&self, flags: u16, payload: &[u8]) -> Option<String> {
        if flags & NLM_F_ACK_TLVS == 0 {
            return None;
        }

        let offset = if flags & NLM_F_CAPPED != 0 {
            std::mem::size_of::<Self>()
        } else {
            std::mem::size_of::<i32>() + nlmsg_align(self.msg.nlmsg_len as usize)
        };

        AttrIter::new(payload.get(offset..)?)
            .find(|(kind, _)| *kind == NLMSGERR_ATTR_MSG)
            .and_then(|(_, data)| get::string(data).ok())
            .map(str::to_owned)
    }

    /// Convert into a crate error, preferring the extended ACK text.
    pub fn to_error(&self, flags: u16, payload: &[u8]) -> Error {
        match self.ext_ack_message(flags, payload) {
            Some(message) => Error::from_errno_with_message(self.error, message),
            None => Error::from_errno(self.error),
        }
    }
}

/// An owned, complete netlink message.
///
/// Requests are handed to a [`Command`](super::Command) as `Message`s and
/// responses are delivered to callbacks as `&Message`. The connection stamps
/// sequence number, port id and request flags on transmit.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    /// Wrap raw bytes holding exactly one netlink message.
    ///
    /// The header length field must match the buffer length.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let header = NlMsgHdr::from_bytes(&buf)?;
        if (header.nlmsg_len as usize) != buf.len() {
            return Err(Error::InvalidMessage(format!(
                "header length {} does not match buffer length {}",
                header.nlmsg_len,
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    pub(crate) fn from_slice(msg: &[u8]) -> Self {
        Self { buf: msg.to_vec() }
    }

    /// Get a copy of the header.
    pub fn header(&self) -> NlMsgHdr {
        // Length was checked on construction.
        NlMsgHdr::read_from_prefix(&self.buf)
            .map(|(h, _)| h)
            .unwrap_or_default()
    }

    /// Message type.
    pub fn msg_type(&self) -> u16 {
        self.header().nlmsg_type
    }

    /// Message flags.
    pub fn flags(&self) -> u16 {
        self.header().nlmsg_flags
    }

    /// Sequence number.
    pub fn seq(&self) -> u32 {
        self.header().nlmsg_seq
    }

    /// Port id of the sender (0 for the kernel).
    pub fn pid(&self) -> u32 {
        self.header().nlmsg_pid
    }

    /// Bytes following the header.
    pub fn payload(&self) -> &[u8] {
        &self.buf[NLMSG_HDRLEN.min(self.buf.len())..]
    }

    /// The whole message, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the message carries no payload.
    pub fn is_empty(&self) -> bool {
        self.buf.len() <= NLMSG_HDRLEN
    }

    /// Consume the message and return its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn set_seq(&mut self, seq: u32) {
        self.update_header(|h| h.nlmsg_seq = seq);
    }

    pub(crate) fn set_pid(&mut self, pid: u32) {
        self.update_header(|h| h.nlmsg_pid = pid);
    }

    pub(crate) fn add_flags(&mut self, flags: u16) {
        self.update_header(|h| h.nlmsg_flags |= flags);
    }

    fn update_header(&mut self, f: impl FnOnce(&mut NlMsgHdr)) {
        let mut header = self.header();
        f(&mut header);
        self.buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
    }
}

impl From<MessageBuilder> for Message {
    fn from(builder: MessageBuilder) -> Self {
        Self {
            buf: builder.finish(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("Message")
            .field("type", &header.nlmsg_type)
            .field("flags", &format_args!("{:#x}", header.nlmsg_flags))
            .field("seq", &header.nlmsg_seq)
            .field("len", &self.buf.len())
            .finish()
    }
}

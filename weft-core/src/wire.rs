//! Fixed-format wire protocol.
//!
//! Every frame is a 32-byte header followed by up to 992 bytes of payload:
//! `[{FIXED HEADER}{VARIABLE LENGTH PAYLOAD}]`. All integers are big-endian.
//! The `length` field counts the whole frame, signature included, and must
//! stay within `[HEADER_SIZE, MTU]`.

use crate::error::WeftError;
use crate::serializer;
use bytes::{Bytes, BytesMut};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Maximum frame size in bytes; anything larger is a protocol error.
pub const MTU: usize = 1024;

/// Maximum payload size in bytes.
pub const PAYLOAD_SIZE: usize = MTU - HEADER_SIZE;

// Field offsets inside the fixed header.
const OFF_LABEL: usize = 0;
const OFF_SOURCE: usize = 8;
const OFF_DESTINATION: usize = 16;
const OFF_LENGTH: usize = 24;
const OFF_SEQUENCE: usize = 26;
const OFF_SESSION: usize = 28;
const OFF_COMMAND: usize = 29;
const OFF_QUALIFIER: usize = 30;
const OFF_STATUS: usize = 31;

/// Frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Authentication and introspection
    Null = 0,
    /// Registration, session keys, lookups
    Basic = 1,
    /// Publish-subscribe
    Multicast = 2,
    /// Controller-mediated routing table management
    Node = 3,
    /// Network management (stabilization)
    Overlay = 4,
}

impl Command {
    /// Decode a raw command byte.
    #[must_use]
    pub const fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Basic),
            2 => Some(Self::Multicast),
            3 => Some(Self::Node),
            4 => Some(Self::Overlay),
            _ => None,
        }
    }
}

/// Command qualifiers (sub-codes), grouped by command.
pub mod qualifier {
    // Command::Null
    pub const NULL: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const AUTHENTICATE: u8 = 2;
    pub const DESCRIBE: u8 = 127;
    // Command::Basic
    pub const REGISTER: u8 = 0;
    pub const TOKEN: u8 = 1;
    pub const FINDROOT: u8 = 2;
    pub const BOOTSTRAP: u8 = 3;
    // Command::Multicast
    pub const PUBLISH: u8 = 0;
    pub const SUBSCRIBE: u8 = 1;
    pub const UNSUBSCRIBE: u8 = 2;
    // Command::Node
    pub const GET_PREDECESSOR: u8 = 0;
    pub const SET_PREDECESSOR: u8 = 1;
    pub const GET_SUCCESSOR: u8 = 2;
    pub const SET_SUCCESSOR: u8 = 3;
    pub const GET_FINGER: u8 = 4;
    pub const SET_FINGER: u8 = 5;
    pub const GET_NEIGHBOURS: u8 = 6;
    pub const NOTIFY: u8 = 7;
    // Command::Overlay
    pub const FIND_SUCCESSOR: u8 = 0;
    pub const PING: u8 = 1;
    pub const MAP: u8 = 2;
}

/// Frame status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Rejected = 0,
    Accepted = 1,
    Request = 127,
}

impl Status {
    /// Decode a raw status byte.
    #[must_use]
    pub const fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Rejected),
            1 => Some(Self::Accepted),
            127 => Some(Self::Request),
            _ => None,
        }
    }
}

pub const REJECTED: u8 = Status::Rejected as u8;
pub const ACCEPTED: u8 = Status::Accepted as u8;
pub const REQUEST: u8 = Status::Request as u8;

/// The fixed-size frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Application-defined; overwritten by the hub during routing
    pub label: u64,
    /// Origin identifier
    pub source: u64,
    /// Target identifier
    pub destination: u64,
    /// Total frame length in bytes
    pub length: u16,
    /// Issued monotonically by the originator
    pub sequence: u16,
    /// Topic id for multicast, channel tag otherwise
    pub session: u8,
    /// Command
    pub command: u8,
    /// Command-specific sub-code
    pub qualifier: u8,
    /// Rejected / accepted / request
    pub status: u8,
}

impl Header {
    /// Zero out every field.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Deserialize from the first `HEADER_SIZE` bytes of `buf`.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            label: serializer::get_u64(buf, OFF_LABEL)?,
            source: serializer::get_u64(buf, OFF_SOURCE)?,
            destination: serializer::get_u64(buf, OFF_DESTINATION)?,
            length: serializer::get_u16(buf, OFF_LENGTH)?,
            sequence: serializer::get_u16(buf, OFF_SEQUENCE)?,
            session: serializer::get_u8(buf, OFF_SESSION)?,
            command: serializer::get_u8(buf, OFF_COMMAND)?,
            qualifier: serializer::get_u8(buf, OFF_QUALIFIER)?,
            status: serializer::get_u8(buf, OFF_STATUS)?,
        })
    }

    /// Serialize into the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// Returns `false` when the buffer is too small.
    pub fn serialize(&self, buf: &mut [u8]) -> bool {
        if buf.len() < HEADER_SIZE {
            return false;
        }
        serializer::put_u64(buf, OFF_LABEL, self.label)
            && serializer::put_u64(buf, OFF_SOURCE, self.source)
            && serializer::put_u64(buf, OFF_DESTINATION, self.destination)
            && serializer::put_u16(buf, OFF_LENGTH, self.length)
            && serializer::put_u16(buf, OFF_SEQUENCE, self.sequence)
            && serializer::put_u8(buf, OFF_SESSION, self.session)
            && serializer::put_u8(buf, OFF_COMMAND, self.command)
            && serializer::put_u8(buf, OFF_QUALIFIER, self.qualifier)
            && serializer::put_u8(buf, OFF_STATUS, self.status)
    }

    /// Quick predicate over (command, qualifier).
    #[must_use]
    pub const fn is_context(&self, command: u8, qualifier: u8) -> bool {
        self.command == command && self.qualifier == qualifier
    }

    /// Quick predicate over (command, qualifier, status).
    #[must_use]
    pub const fn is_request(&self, command: u8, qualifier: u8) -> bool {
        self.command == command && self.qualifier == qualifier && self.status == REQUEST
    }
}

// Direct buffer accessors for fields the hub rewrites in place.

/// Write the label field directly into a serialized frame.
pub fn write_label(buf: &mut [u8], label: u64) -> bool {
    serializer::put_u64(buf, OFF_LABEL, label)
}

/// Write the source field directly into a serialized frame.
pub fn write_source(buf: &mut [u8], source: u64) -> bool {
    serializer::put_u64(buf, OFF_SOURCE, source)
}

/// Write the destination field directly into a serialized frame.
pub fn write_destination(buf: &mut [u8], destination: u64) -> bool {
    serializer::put_u64(buf, OFF_DESTINATION, destination)
}

/// Write the length field directly into a serialized frame.
pub fn write_length(buf: &mut [u8], length: u16) -> bool {
    serializer::put_u16(buf, OFF_LENGTH, length)
}

/// Write the session field directly into a serialized frame.
pub fn write_session(buf: &mut [u8], session: u8) -> bool {
    serializer::put_u8(buf, OFF_SESSION, session)
}

/// Write the command field directly into a serialized frame.
pub fn write_command(buf: &mut [u8], command: u8) -> bool {
    serializer::put_u8(buf, OFF_COMMAND, command)
}

/// Write the qualifier field directly into a serialized frame.
pub fn write_qualifier(buf: &mut [u8], qualifier: u8) -> bool {
    serializer::put_u8(buf, OFF_QUALIFIER, qualifier)
}

/// Write the status field directly into a serialized frame.
pub fn write_status(buf: &mut [u8], status: u8) -> bool {
    serializer::put_u8(buf, OFF_STATUS, status)
}

/// Read the length field from a serialized frame.
#[must_use]
pub fn read_length(buf: &[u8]) -> Option<u16> {
    serializer::get_u16(buf, OFF_LENGTH)
}

/// Stateful frame decoder.
///
/// Accumulates raw reads and yields complete frames. The length field is
/// validated as soon as a header is visible; a frame outside
/// `[HEADER_SIZE, MTU]` poisons the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    staging: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            staging: BytesMut::with_capacity(MTU),
        }
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, src: &[u8]) {
        self.staging.extend_from_slice(src);
    }

    /// Discard everything buffered (resync after a malformed frame).
    pub fn clear(&mut self) {
        self.staging.clear();
    }

    /// Bytes buffered but not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.staging.len()
    }

    /// Decode a single frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` → complete frame extracted
    /// - `Ok(None)` → need more data
    /// - `Err` → protocol violation, connection must be closed
    pub fn decode(&mut self) -> Result<Option<Bytes>, WeftError> {
        if self.staging.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = read_length(&self.staging).unwrap_or(0) as usize;
        if !(HEADER_SIZE..=MTU).contains(&length) {
            return Err(WeftError::frame(format!("bad frame length {length}")));
        }

        if self.staging.len() < length {
            return Ok(None);
        }

        Ok(Some(self.staging.split_to(length).freeze()))
    }
}

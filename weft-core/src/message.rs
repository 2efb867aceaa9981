//! Pooled message frames.
//!
//! A message carries two views of the same frame:
//!
//! - the **routing view** (`Header`), which the hub mutates freely while
//!   deciding where the frame goes next, and
//! - the **wire view** (the serialized buffer), which is what the remote end
//!   eventually sees.
//!
//! `set_*` touches the routing view only, `write_*` the wire view only and
//! `put_*` both. Keeping the views separate lets the hub forward a frame to a
//! gateway connection while the buffer still names the logical destination.

use crate::error::WeftError;
use crate::serializer;
use crate::wire::{self, Header, HEADER_SIZE, MTU};

/// Never dropped under pressure.
pub const FLAG_PRIORITY: u8 = 0x01;
/// Caught by the registration intercept; bypasses normal routing.
pub const FLAG_TRAP: u8 = 0x02;
/// Scheduled to sink at the local hub without processing.
pub const FLAG_INVALID: u8 = 0x04;

/// A fixed-capacity frame owned by the message pool.
pub struct Message {
    header: Header,
    buffer: [u8; MTU],
    origin: u64,
    group: u8,
    hops: u8,
    flags: u8,
    refs: u16,
}

impl Message {
    /// A standalone frame outside the pool (builders and tests).
    ///
    /// Call `build` or `load_frame` before using any accessor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: Header::default(),
            buffer: [0; MTU],
            origin: 0,
            group: 0,
            hops: 0,
            flags: 0,
            refs: 0,
        }
    }

    pub(crate) fn reset(&mut self, origin: u64) {
        self.header.clear();
        self.header.length = HEADER_SIZE as u16;
        self.origin = origin;
        self.group = 0;
        self.hops = 0;
        self.flags = 0;
    }

    /// Identifier of the connection this frame arrived on. Immutable.
    #[must_use]
    pub const fn origin(&self) -> u64 {
        self.origin
    }

    /// Group tag of the originating connection (transit metadata).
    #[must_use]
    pub const fn group(&self) -> u8 {
        self.group
    }

    pub fn set_group(&mut self, group: u8) {
        self.group = group;
    }

    /// Forwarding hop count; capped by the hub to drop loops.
    #[must_use]
    pub const fn hops(&self) -> u8 {
        self.hops
    }

    /// Increment the hop counter, saturating, and return the new value.
    pub fn bump_hops(&mut self) -> u8 {
        self.hops = self.hops.saturating_add(1);
        self.hops
    }

    #[must_use]
    pub const fn test_flags(&self, mask: u8) -> bool {
        self.flags & mask != 0
    }

    pub fn set_flags(&mut self, mask: u8) {
        self.flags |= mask;
    }

    pub fn clear_flags(&mut self, mask: u8) {
        self.flags &= !mask;
    }

    pub(crate) const fn refs(&self) -> u16 {
        self.refs
    }

    pub(crate) fn set_refs(&mut self, refs: u16) {
        self.refs = refs;
    }

    //=================================================================
    // Frame ingestion and construction

    /// Load an inbound frame into the buffer and unpack its header.
    ///
    /// Fails unless `HEADER_SIZE <= frame.len() <= MTU` and the length field
    /// agrees with the byte count.
    pub fn load_frame(&mut self, frame: &[u8]) -> Result<(), WeftError> {
        if !(HEADER_SIZE..=MTU).contains(&frame.len()) {
            return Err(WeftError::frame(format!("bad frame size {}", frame.len())));
        }
        let header = Header::deserialize(frame)
            .ok_or_else(|| WeftError::frame("truncated header"))?;
        if header.length as usize != frame.len() {
            return Err(WeftError::frame(format!(
                "length field {} disagrees with frame size {}",
                header.length,
                frame.len()
            )));
        }
        self.buffer[..frame.len()].copy_from_slice(frame);
        self.header = header;
        Ok(())
    }

    /// Build an outbound frame from scratch: both views take `header`.
    pub fn build(&mut self, header: Header) {
        self.header = header;
        self.header.serialize(&mut self.buffer);
    }

    /// Both views agree and the length is inside the permitted window.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let length = self.header.length as usize;
        (HEADER_SIZE..=MTU).contains(&length)
            && wire::read_length(&self.buffer) == Some(self.header.length)
    }

    /// The serialized frame as currently bounded by the routing length.
    #[must_use]
    pub fn frame(&self) -> &[u8] {
        &self.buffer[..self.header.length as usize]
    }

    //=================================================================
    // Routing view

    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub const fn label(&self) -> u64 {
        self.header.label
    }

    #[must_use]
    pub const fn source(&self) -> u64 {
        self.header.source
    }

    #[must_use]
    pub const fn destination(&self) -> u64 {
        self.header.destination
    }

    #[must_use]
    pub const fn length(&self) -> u16 {
        self.header.length
    }

    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.header.length as usize - HEADER_SIZE
    }

    #[must_use]
    pub const fn sequence(&self) -> u16 {
        self.header.sequence
    }

    #[must_use]
    pub const fn session(&self) -> u8 {
        self.header.session
    }

    #[must_use]
    pub const fn command(&self) -> u8 {
        self.header.command
    }

    #[must_use]
    pub const fn qualifier(&self) -> u8 {
        self.header.qualifier
    }

    #[must_use]
    pub const fn status(&self) -> u8 {
        self.header.status
    }

    pub fn set_label(&mut self, label: u64) {
        self.header.label = label;
    }

    pub fn set_source(&mut self, source: u64) {
        self.header.source = source;
    }

    pub fn set_destination(&mut self, destination: u64) {
        self.header.destination = destination;
    }

    pub fn set_status(&mut self, status: u8) {
        self.header.status = status;
    }

    //=================================================================
    // Wire view

    pub fn write_label(&mut self, label: u64) {
        wire::write_label(&mut self.buffer, label);
    }

    pub fn write_source(&mut self, source: u64) {
        wire::write_source(&mut self.buffer, source);
    }

    pub fn write_destination(&mut self, destination: u64) {
        wire::write_destination(&mut self.buffer, destination);
    }

    pub fn write_status(&mut self, status: u8) {
        wire::write_status(&mut self.buffer, status);
    }

    //=================================================================
    // Both views

    pub fn put_label(&mut self, label: u64) {
        self.set_label(label);
        self.write_label(label);
    }

    pub fn put_source(&mut self, source: u64) {
        self.set_source(source);
        self.write_source(source);
    }

    pub fn put_destination(&mut self, destination: u64) {
        self.set_destination(destination);
        self.write_destination(destination);
    }

    pub fn put_session(&mut self, session: u8) {
        self.header.session = session;
        wire::write_session(&mut self.buffer, session);
    }

    pub fn put_status(&mut self, status: u8) {
        self.set_status(status);
        self.write_status(status);
    }

    pub fn put_command(&mut self, command: u8) {
        self.header.command = command;
        wire::write_command(&mut self.buffer, command);
    }

    pub fn put_qualifier(&mut self, qualifier: u8) {
        self.header.qualifier = qualifier;
        wire::write_qualifier(&mut self.buffer, qualifier);
    }

    /// Set the frame length in both views.
    ///
    /// Returns `false` when `length` falls outside `[HEADER_SIZE, MTU]`.
    pub fn put_length(&mut self, length: u16) -> bool {
        if !(HEADER_SIZE..=MTU).contains(&(length as usize)) {
            return false;
        }
        self.header.length = length;
        wire::write_length(&mut self.buffer, length)
    }

    //=================================================================
    // Payload access (offsets relative to the payload start)

    #[must_use]
    pub fn data8(&self, offset: usize) -> Option<u8> {
        self.payload_slot(offset, 1)?;
        serializer::get_u8(&self.buffer, HEADER_SIZE + offset)
    }

    #[must_use]
    pub fn data16(&self, offset: usize) -> Option<u16> {
        self.payload_slot(offset, 2)?;
        serializer::get_u16(&self.buffer, HEADER_SIZE + offset)
    }

    #[must_use]
    pub fn data32(&self, offset: usize) -> Option<u32> {
        self.payload_slot(offset, 4)?;
        serializer::get_u32(&self.buffer, HEADER_SIZE + offset)
    }

    #[must_use]
    pub fn data64(&self, offset: usize) -> Option<u64> {
        self.payload_slot(offset, 8)?;
        serializer::get_u64(&self.buffer, HEADER_SIZE + offset)
    }

    /// Borrow `len` payload bytes at `offset`, bounded by the frame length.
    #[must_use]
    pub fn data_bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.payload_slot(offset, len)?;
        serializer::get_blob(&self.buffer, HEADER_SIZE + offset, len)
    }

    /// The whole payload as currently bounded by the frame length.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..self.header.length as usize]
    }

    fn payload_slot(&self, offset: usize, len: usize) -> Option<()> {
        (offset + len <= self.payload_length()).then_some(())
    }

    // Writers are bounded by the MTU, not the current length: handlers fill
    // fields first and commit the final size with `put_length`.

    pub fn set_data8(&mut self, offset: usize, value: u8) -> bool {
        serializer::put_u8(&mut self.buffer, HEADER_SIZE + offset, value)
    }

    pub fn set_data16(&mut self, offset: usize, value: u16) -> bool {
        serializer::put_u16(&mut self.buffer, HEADER_SIZE + offset, value)
    }

    pub fn set_data32(&mut self, offset: usize, value: u32) -> bool {
        serializer::put_u32(&mut self.buffer, HEADER_SIZE + offset, value)
    }

    pub fn set_data64(&mut self, offset: usize, value: u64) -> bool {
        serializer::put_u64(&mut self.buffer, HEADER_SIZE + offset, value)
    }

    pub fn set_double(&mut self, offset: usize, value: f64) -> bool {
        serializer::put_f64(&mut self.buffer, HEADER_SIZE + offset, value)
    }

    pub fn set_data_bytes(&mut self, offset: usize, src: &[u8]) -> bool {
        serializer::put_blob(&mut self.buffer, HEADER_SIZE + offset, src)
    }

    /// Append bytes at the end of the frame and extend the length (both
    /// views). Fails when the result would not fit in the MTU.
    pub fn append_bytes(&mut self, src: &[u8]) -> bool {
        let length = self.header.length as usize;
        if length + src.len() > MTU {
            return false;
        }
        self.buffer[length..length + src.len()].copy_from_slice(src);
        self.put_length((length + src.len()) as u16)
    }

    /// Append a big-endian `u64` at the end of the frame.
    pub fn append_data64(&mut self, value: u64) -> bool {
        self.append_bytes(&value.to_be_bytes())
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("origin", &self.origin)
            .field("group", &self.group)
            .field("hops", &self.hops)
            .field("flags", &self.flags)
            .field("refs", &self.refs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{qualifier, Command, REQUEST};

    fn request_header(length: u16) -> Header {
        Header {
            label: 0,
            source: 70000,
            destination: 3,
            length,
            sequence: 11,
            session: 0,
            command: Command::Basic as u8,
            qualifier: qualifier::FINDROOT,
            status: REQUEST,
        }
    }

    #[test]
    fn load_frame_checks_bounds() {
        let mut msg = Message::new();
        msg.reset(1);

        let mut frame = vec![0u8; 40];
        request_header(40).serialize(&mut frame);
        assert!(msg.load_frame(&frame).is_ok());
        assert!(msg.is_valid());
        assert_eq!(msg.payload_length(), 8);

        // Length field disagreeing with the byte count is rejected.
        let mut bad = frame.clone();
        wire::write_length(&mut bad, 48);
        assert!(msg.load_frame(&bad).is_err());

        // Truncated header.
        assert!(msg.load_frame(&frame[..31]).is_err());
    }

    #[test]
    fn views_diverge_and_converge() {
        let mut msg = Message::new();
        msg.reset(9);
        msg.build(request_header(40));
        msg.set_data64(0, 0xAA);

        // Routing view redirected to a gateway; wire view keeps the target.
        msg.set_destination(5);
        assert_eq!(msg.destination(), 5);
        assert_eq!(Header::deserialize(msg.frame()).unwrap().destination, 3);

        // put_* updates both.
        msg.put_destination(42);
        assert_eq!(msg.destination(), 42);
        assert_eq!(Header::deserialize(msg.frame()).unwrap().destination, 42);
    }

    #[test]
    fn append_respects_mtu() {
        let mut msg = Message::new();
        msg.reset(9);
        msg.build(request_header(HEADER_SIZE as u16));

        assert!(msg.append_data64(7));
        assert_eq!(msg.length() as usize, HEADER_SIZE + 8);
        assert_eq!(msg.data64(0), Some(7));

        let big = [0u8; MTU];
        assert!(!msg.append_bytes(&big));
    }

    #[test]
    fn payload_reads_are_bounded_by_length() {
        let mut msg = Message::new();
        msg.reset(9);
        msg.build(request_header(40));
        assert!(msg.data64(0).is_some());
        assert!(msg.data64(1).is_none());
        assert!(msg.data_bytes(0, 9).is_none());
    }
}

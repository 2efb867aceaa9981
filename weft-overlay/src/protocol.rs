//! Frame builders and parsers for hub-to-hub exchanges.
//!
//! The stabilizer and the proxy handshake build complete frames outside the
//! message pool; the hub parses them back with the same helpers. Payload
//! layouts follow the request handlers in the hub dispatcher.

use bytes::{Bytes, BytesMut};
use weft_core::wire::{qualifier, Command, Header, HEADER_SIZE, MTU, REQUEST};

/// A request header with the common fields filled in.
#[must_use]
pub fn request_header(
    source: u64,
    destination: u64,
    sequence: u16,
    session: u8,
    command: Command,
    qualifier: u8,
) -> Header {
    Header {
        label: 0,
        source,
        destination,
        length: HEADER_SIZE as u16,
        sequence,
        session,
        command: command as u8,
        qualifier,
        status: REQUEST,
    }
}

/// Serialize a header and payload into one frame.
///
/// The length field is computed from the payload; oversized payloads are
/// truncated to keep the frame inside the MTU (callers never come close).
#[must_use]
pub fn build_frame(mut header: Header, payload: &[u8]) -> Bytes {
    let payload = &payload[..payload.len().min(MTU - HEADER_SIZE)];
    header.length = (HEADER_SIZE + payload.len()) as u16;
    let mut buf = BytesMut::with_capacity(header.length as usize);
    buf.resize(HEADER_SIZE, 0);
    header.serialize(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split a frame into header and payload, validating the length field.
#[must_use]
pub fn parse_frame(data: &[u8]) -> Option<(Header, &[u8])> {
    let header = Header::deserialize(data)?;
    let length = header.length as usize;
    if !(HEADER_SIZE..=MTU).contains(&length) || length != data.len() {
        return None;
    }
    Some((header, &data[HEADER_SIZE..length]))
}

/// `node/get_predecessor` request toward `destination`.
#[must_use]
pub fn get_predecessor_request(source: u64, destination: u64, sequence: u16) -> Bytes {
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            0,
            Command::Node,
            qualifier::GET_PREDECESSOR,
        ),
        &[],
    )
}

/// `node/get_successor` request toward `destination`.
#[must_use]
pub fn get_successor_request(source: u64, destination: u64, sequence: u16) -> Bytes {
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            0,
            Command::Node,
            qualifier::GET_SUCCESSOR,
        ),
        &[],
    )
}

/// `node/set_successor` request carrying the new successor.
#[must_use]
pub fn set_successor_request(
    source: u64,
    destination: u64,
    sequence: u16,
    successor: u64,
) -> Bytes {
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            0,
            Command::Node,
            qualifier::SET_SUCCESSOR,
        ),
        &successor.to_be_bytes(),
    )
}

/// `node/set_finger` request carrying `(index, id)`.
#[must_use]
pub fn set_finger_request(
    source: u64,
    destination: u64,
    sequence: u16,
    index: u32,
    id: u64,
) -> Bytes {
    let mut payload = [0u8; 12];
    payload[..4].copy_from_slice(&index.to_be_bytes());
    payload[4..].copy_from_slice(&id.to_be_bytes());
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            0,
            Command::Node,
            qualifier::SET_FINGER,
        ),
        &payload,
    )
}

/// `node/notify` request announcing `candidate` as a predecessor.
#[must_use]
pub fn notify_request(source: u64, destination: u64, sequence: u16, candidate: u64) -> Bytes {
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            0,
            Command::Node,
            qualifier::NOTIFY,
        ),
        &candidate.to_be_bytes(),
    )
}

/// `overlay/find_successor` request for `key`; the session byte carries the
/// finger index so stale replies cannot be confused across rounds.
#[must_use]
pub fn find_successor_request(
    source: u64,
    destination: u64,
    sequence: u16,
    session: u8,
    key: u64,
) -> Bytes {
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            session,
            Command::Overlay,
            qualifier::FIND_SUCCESSOR,
        ),
        &key.to_be_bytes(),
    )
}

/// `overlay/ping` request.
#[must_use]
pub fn ping_request(source: u64, destination: u64, sequence: u16) -> Bytes {
    build_frame(
        request_header(
            source,
            destination,
            sequence,
            0,
            Command::Overlay,
            qualifier::PING,
        ),
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_round_trip() {
        let frame = set_finger_request(100, 0, 7, 3, 4242);
        let (header, payload) = parse_frame(&frame).unwrap();
        assert_eq!(header.source, 100);
        assert_eq!(header.sequence, 7);
        assert_eq!(header.command, Command::Node as u8);
        assert_eq!(header.qualifier, qualifier::SET_FINGER);
        assert_eq!(header.status, REQUEST);
        assert_eq!(payload.len(), 12);
        assert_eq!(u32::from_be_bytes(payload[..4].try_into().unwrap()), 3);
        assert_eq!(u64::from_be_bytes(payload[4..].try_into().unwrap()), 4242);
    }

    #[test]
    fn empty_payload_request_is_header_only() {
        let frame = ping_request(5, 0, 1);
        assert_eq!(frame.len(), HEADER_SIZE);
        let (header, payload) = parse_frame(&frame).unwrap();
        assert_eq!(header.qualifier, qualifier::PING);
        assert!(payload.is_empty());
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let frame = ping_request(5, 0, 1);
        let mut longer = frame.to_vec();
        longer.push(0);
        assert!(parse_frame(&longer).is_none());
        assert!(parse_frame(&frame[..16]).is_none());
    }
}

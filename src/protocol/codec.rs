//! Transport frame codec
//!
//! Request frame layout (all header fields in the configured byte order):
//! - 2 bytes start marker (`i16::MAX`)
//! - 4 bytes total frame length, start marker through terminator
//! - 2 bytes sequence id
//! - 2 bytes command id
//! - 1 byte reply-expected flag
//! - payload
//! - 2 bytes terminator (`i16::MIN`)
//!
//! Replies are `length(4) [sequence(2)] payload`, the sequence id only when
//! the request carried a non-zero one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub const START_MARKER: i16 = i16::MAX;
pub const TERMINATOR: i16 = i16::MIN;

/// Start marker + length + sequence + command + reply flag
pub const HEADER_SIZE: usize = 11;
pub const TERMINATOR_SIZE: usize = 2;
pub const ENVELOPE_SIZE: usize = HEADER_SIZE + TERMINATOR_SIZE;

/// Reply length field
pub const REPLY_LENGTH_SIZE: usize = 4;

/// Reserved command id for reply-channel registration
pub const REPLY_CHANNEL_COMMAND: i16 = i16::MIN;

/// Reply payload sent when a handler produced nothing
pub const EMPTY_REPLY: [u8; 4] = [241, 216, 255, 255];

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid start marker: {0:#06x}")]
    InvalidStartMarker(i16),

    #[error("Invalid terminator: {0:#06x}")]
    InvalidTerminator(i16),

    #[error("Invalid frame length: {0}")]
    InvalidLength(i64),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Oversized frame of {0} bytes discarded")]
    FrameDiscarded(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Byte order of transport header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    /// Big-endian
    Network,
}

impl ByteOrder {
    pub fn from_network_flag(use_network_order: bool) -> Self {
        if use_network_order {
            ByteOrder::Network
        } else {
            ByteOrder::Little
        }
    }

    pub fn put_i16(self, buf: &mut impl BufMut, value: i16) {
        match self {
            ByteOrder::Little => buf.put_i16_le(value),
            ByteOrder::Network => buf.put_i16(value),
        }
    }

    pub fn put_i32(self, buf: &mut impl BufMut, value: i32) {
        match self {
            ByteOrder::Little => buf.put_i32_le(value),
            ByteOrder::Network => buf.put_i32(value),
        }
    }

    pub fn read_i16(self, bytes: &[u8]) -> i16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            ByteOrder::Little => i16::from_le_bytes(raw),
            ByteOrder::Network => i16::from_be_bytes(raw),
        }
    }

    pub fn read_i32(self, bytes: &[u8]) -> i32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Network => i32::from_be_bytes(raw),
        }
    }
}

/// One reassembled request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: i16,
    pub command_id: i16,
    pub reply_expected: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(sequence: i16, command_id: i16, reply_expected: bool, payload: Bytes) -> Self {
        Self {
            sequence,
            command_id,
            reply_expected,
            payload,
        }
    }
}

/// Fixed header fields of a frame
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: usize,
    sequence: i16,
    command_id: i16,
    reply_expected: bool,
}

/// Encodes request frames
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    byte_order: ByteOrder,
}

impl Encoder {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }

    /// Append one frame to `buf`
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> CodecResult<()> {
        let length = frame.payload.len() + ENVELOPE_SIZE;
        let wire_length = i32::try_from(length)
            .map_err(|_| CodecError::MessageTooLarge(length, i32::MAX as usize))?;

        buf.reserve(length);
        self.byte_order.put_i16(buf, START_MARKER);
        self.byte_order.put_i32(buf, wire_length);
        self.byte_order.put_i16(buf, frame.sequence);
        self.byte_order.put_i16(buf, frame.command_id);
        buf.put_u8(u8::from(frame.reply_expected));
        buf.put_slice(&frame.payload);
        self.byte_order.put_i16(buf, TERMINATOR);
        Ok(())
    }

    /// Append a reply frame; `None` is sent as the empty-reply sentinel
    pub fn encode_reply(&self, sequence: i16, reply: Option<&[u8]>, buf: &mut BytesMut) -> CodecResult<()> {
        let reply = reply.unwrap_or(&EMPTY_REPLY);
        let mut length = reply.len() + REPLY_LENGTH_SIZE;
        if sequence != 0 {
            length += 2;
        }
        let wire_length = i32::try_from(length)
            .map_err(|_| CodecError::MessageTooLarge(length, i32::MAX as usize))?;

        buf.reserve(length);
        self.byte_order.put_i32(buf, wire_length);
        if sequence != 0 {
            self.byte_order.put_i16(buf, sequence);
        }
        buf.put_slice(reply);
        Ok(())
    }
}

/// Reassembles frames from arbitrary read chunks
pub struct Decoder {
    byte_order: ByteOrder,
    initial_message_size: usize,
    max_message_size: usize,
    discard_too_big: bool,
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Body(FrameHeader),
    Discarding {
        length: usize,
        remaining: usize,
    },
}

impl Decoder {
    pub fn new(
        byte_order: ByteOrder,
        initial_message_size: usize,
        max_message_size: usize,
        discard_too_big: bool,
    ) -> Self {
        Self {
            byte_order,
            initial_message_size,
            max_message_size,
            discard_too_big,
            state: DecodeState::Header,
        }
    }

    /// Whether the decoder is between frames
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
    }

    /// Attempt to decode a frame from the buffer.
    /// Returns Ok(None) if more data is needed. Errors leave the decoder
    /// ready for the next frame; bytes after the failed frame are kept.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Frame>> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::Header => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }

                    let start = self.byte_order.read_i16(&buf[0..2]);
                    if start != START_MARKER {
                        buf.clear();
                        self.shrink(buf);
                        return Err(CodecError::InvalidStartMarker(start));
                    }

                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = self.byte_order.read_i32(&buf[2..6]);
                    if length < ENVELOPE_SIZE as i32 {
                        buf.clear();
                        self.shrink(buf);
                        return Err(CodecError::InvalidLength(i64::from(length)));
                    }
                    let length = length as usize;

                    let header = FrameHeader {
                        length,
                        sequence: self.byte_order.read_i16(&buf[6..8]),
                        command_id: self.byte_order.read_i16(&buf[8..10]),
                        reply_expected: buf[10] != 0,
                    };

                    if length > self.max_message_size && self.discard_too_big {
                        self.state = DecodeState::Discarding {
                            length,
                            remaining: length,
                        };
                        continue;
                    }

                    // Past the limit the buffer grows only as bytes arrive
                    let expected = length.min(self.max_message_size);
                    buf.reserve(expected.saturating_sub(buf.len()));
                    self.state = DecodeState::Body(header);
                }
                DecodeState::Body(header) => {
                    if buf.len() < header.length {
                        self.state = DecodeState::Body(header);
                        return Ok(None);
                    }

                    let frame = buf.split_to(header.length).freeze();
                    if header.length > self.max_message_size {
                        self.shrink(buf);
                    }

                    let terminator = self
                        .byte_order
                        .read_i16(&frame[header.length - TERMINATOR_SIZE..]);
                    if terminator != TERMINATOR {
                        return Err(CodecError::InvalidTerminator(terminator));
                    }

                    let payload = frame.slice(HEADER_SIZE..header.length - TERMINATOR_SIZE);
                    return Ok(Some(Frame::new(
                        header.sequence,
                        header.command_id,
                        header.reply_expected,
                        payload,
                    )));
                }
                DecodeState::Discarding { length, remaining } => {
                    let dropped = remaining.min(buf.len());
                    buf.advance(dropped);
                    if dropped < remaining {
                        self.state = DecodeState::Discarding {
                            length,
                            remaining: remaining - dropped,
                        };
                        return Ok(None);
                    }
                    return Err(CodecError::FrameDiscarded(length));
                }
            }
        }
    }

    /// Give an oversized buffer back and start over at the initial size
    fn shrink(&self, buf: &mut BytesMut) {
        if buf.capacity() <= self.max_message_size.max(self.initial_message_size) {
            return;
        }
        let leftover = buf.split();
        *buf = BytesMut::with_capacity(self.initial_message_size.max(leftover.len()));
        buf.extend_from_slice(&leftover);
    }
}

/// Decoded reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub sequence: i16,
    /// `None` when the server sent the empty-reply sentinel
    pub payload: Option<Bytes>,
}

/// Reassembles reply frames on the client side
pub struct ReplyDecoder {
    byte_order: ByteOrder,
    max_message_size: usize,
}

impl ReplyDecoder {
    pub fn new(byte_order: ByteOrder, max_message_size: usize) -> Self {
        Self {
            byte_order,
            max_message_size,
        }
    }

    /// Decode one reply. `with_sequence` must match whether the request
    /// carried a non-zero sequence id.
    pub fn decode(&mut self, buf: &mut BytesMut, with_sequence: bool) -> CodecResult<Option<Reply>> {
        if buf.len() < REPLY_LENGTH_SIZE {
            return Ok(None);
        }
        let length = self.byte_order.read_i32(&buf[0..4]);
        let prefix = REPLY_LENGTH_SIZE + if with_sequence { 2 } else { 0 };
        if length < prefix as i32 {
            return Err(CodecError::InvalidLength(i64::from(length)));
        }
        let length = length as usize;
        if length > self.max_message_size + prefix {
            return Err(CodecError::MessageTooLarge(length, self.max_message_size));
        }
        if buf.len() < length {
            return Ok(None);
        }

        let reply = buf.split_to(length).freeze();
        let sequence = if with_sequence {
            self.byte_order.read_i16(&reply[4..6])
        } else {
            0
        };
        let body = reply.slice(prefix..);
        let payload = if body[..] == EMPTY_REPLY { None } else { Some(body) };
        Ok(Some(Reply { sequence, payload }))
    }
}

/// Payload of a reply-channel registration: IPv4 address then i32 port
pub fn encode_reply_channel_request(endpoint: SocketAddrV4, byte_order: ByteOrder) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_slice(&endpoint.ip().octets());
    byte_order.put_i32(&mut buf, i32::from(endpoint.port()));
    buf.freeze()
}

pub fn decode_reply_channel_request(payload: &[u8], byte_order: ByteOrder) -> Option<SocketAddrV4> {
    if payload.len() < 8 {
        return None;
    }
    let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
    let port = u16::try_from(byte_order.read_i32(&payload[4..8])).ok()?;
    Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(order: ByteOrder) -> Decoder {
        Decoder::new(order, 64, 256, false)
    }

    fn encode(order: ByteOrder, frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        Encoder::new(order).encode(frame, &mut buf).unwrap();
        buf
    }

    fn sample_frame() -> Frame {
        Frame::new(5, 3, true, Bytes::from_static(b"relay payload bytes"))
    }

    #[test]
    fn test_header_layout() {
        for order in [ByteOrder::Little, ByteOrder::Network] {
            let frame = sample_frame();
            let buf = encode(order, &frame);
            assert_eq!(buf.len(), frame.payload.len() + ENVELOPE_SIZE);
            assert_eq!(order.read_i16(&buf[0..2]), START_MARKER);
            assert_eq!(order.read_i32(&buf[2..6]) as usize, buf.len());
            assert_eq!(order.read_i16(&buf[6..8]), 5);
            assert_eq!(order.read_i16(&buf[8..10]), 3);
            assert_eq!(buf[10], 1);
            assert_eq!(order.read_i16(&buf[buf.len() - 2..]), TERMINATOR);
        }
        let buf = encode(ByteOrder::Network, &sample_frame());
        assert_eq!(&buf[0..2], &[0x7F, 0xFF]);
    }

    #[test]
    fn test_fragmentation_at_every_chunk_size() {
        let frame = sample_frame();
        let wire = encode(ByteOrder::Little, &frame);

        for chunk in 1..=wire.len() {
            let mut decoder = decoder(ByteOrder::Little);
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(f) = decoder.decode(&mut buf).unwrap() {
                    frames.push(f);
                }
            }
            assert_eq!(frames, vec![frame.clone()], "chunk size {}", chunk);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_multiple_frames_and_trailing_partial() {
        let first = sample_frame();
        let second = Frame::new(0, 1, false, Bytes::from_static(&[9, 9]));
        let third = Frame::new(6, 4, true, Bytes::new());

        let mut wire = encode(ByteOrder::Network, &first);
        wire.extend_from_slice(&encode(ByteOrder::Network, &second));
        let third_wire = encode(ByteOrder::Network, &third);
        wire.extend_from_slice(&third_wire[..5]);

        let mut decoder = decoder(ByteOrder::Network);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(second));
        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
        assert_eq!(wire.len(), 5);

        wire.extend_from_slice(&third_wire[5..]);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(third));
    }

    #[test]
    fn test_bad_start_marker_discards_buffer() {
        let mut decoder = decoder(ByteOrder::Little);
        let mut buf = BytesMut::from(&[1u8, 2, 3, 4, 5][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::InvalidStartMarker(_))
        ));
        assert!(buf.is_empty());

        // The next well-formed frame still decodes
        let frame = sample_frame();
        let mut buf = encode(ByteOrder::Little, &frame);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_bad_terminator_keeps_following_frame() {
        let mut wire = encode(ByteOrder::Little, &sample_frame());
        let end = wire.len();
        wire[end - 1] = 0x00;
        wire[end - 2] = 0x00;
        let next = Frame::new(0, 2, false, Bytes::from_static(b"next"));
        wire.extend_from_slice(&encode(ByteOrder::Little, &next));

        let mut decoder = decoder(ByteOrder::Little);
        assert!(matches!(
            decoder.decode(&mut wire),
            Err(CodecError::InvalidTerminator(0))
        ));
        assert!(decoder.is_idle());
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(next));
    }

    #[test]
    fn test_length_below_envelope_is_rejected() {
        let mut buf = BytesMut::new();
        ByteOrder::Little.put_i16(&mut buf, START_MARKER);
        ByteOrder::Little.put_i32(&mut buf, 4);
        buf.put_slice(&[0; 5]);

        let mut decoder = decoder(ByteOrder::Little);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::InvalidLength(4))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_discarded_as_received() {
        let big = Frame::new(1, 1, false, Bytes::from(vec![7u8; 1000]));
        let small = Frame::new(2, 1, false, Bytes::from_static(b"ok"));
        let mut wire = encode(ByteOrder::Little, &big);
        wire.extend_from_slice(&encode(ByteOrder::Little, &small));

        let mut decoder = Decoder::new(ByteOrder::Little, 64, 256, true);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        let mut discarded = 0;
        for piece in wire.chunks(100) {
            buf.extend_from_slice(piece);
            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(f)) => frames.push(f),
                    Ok(None) => break,
                    Err(CodecError::FrameDiscarded(len)) => {
                        assert_eq!(len, 1013);
                        discarded += 1;
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            // Never holds more than one chunk while discarding
            assert!(buf.len() <= 100);
        }
        assert_eq!(discarded, 1);
        assert_eq!(frames, vec![small]);
    }

    #[test]
    fn test_oversized_frame_delivered_then_buffer_shrinks() {
        let big = Frame::new(1, 1, false, Bytes::from(vec![7u8; 1000]));
        let mut buf = encode(ByteOrder::Little, &big);

        let mut decoder = Decoder::new(ByteOrder::Little, 64, 256, false);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(big));
        assert!(buf.capacity() <= 256);
    }

    #[test]
    fn test_huge_length_header_does_not_preallocate() {
        let mut decoder = Decoder::new(ByteOrder::Little, 8192, 20480, false);
        let mut buf = BytesMut::with_capacity(64);
        ByteOrder::Little.put_i16(&mut buf, START_MARKER);
        ByteOrder::Little.put_i32(&mut buf, 1_000_000_000);
        ByteOrder::Little.put_i16(&mut buf, 3);
        ByteOrder::Little.put_i16(&mut buf, 1);
        buf.put_u8(0);

        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(!decoder.is_idle());
        assert!(buf.capacity() < 2 * 20480);

        // A few more body bytes keep the buffer bounded by what arrived
        buf.extend_from_slice(&[0u8; 4096]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() < 1_000_000);
    }

    #[test]
    fn test_reply_roundtrip() {
        for order in [ByteOrder::Little, ByteOrder::Network] {
            let encoder = Encoder::new(order);
            let mut reply_decoder = ReplyDecoder::new(order, 1024);

            let mut buf = BytesMut::new();
            encoder.encode_reply(5, Some(b"abc"), &mut buf).unwrap();
            assert_eq!(order.read_i32(&buf[0..4]), 9);
            let reply = reply_decoder.decode(&mut buf, true).unwrap().unwrap();
            assert_eq!(reply.sequence, 5);
            assert_eq!(reply.payload.as_deref(), Some(&b"abc"[..]));

            encoder.encode_reply(0, None, &mut buf).unwrap();
            assert_eq!(buf.len(), 8);
            let reply = reply_decoder.decode(&mut buf, false).unwrap().unwrap();
            assert_eq!(reply.sequence, 0);
            assert_eq!(reply.payload, None);
        }
    }

    #[test]
    fn test_reply_channel_request() {
        let endpoint = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 9000);
        for order in [ByteOrder::Little, ByteOrder::Network] {
            let payload = encode_reply_channel_request(endpoint, order);
            assert_eq!(payload.len(), 8);
            assert_eq!(decode_reply_channel_request(&payload, order), Some(endpoint));
        }
        assert_eq!(decode_reply_channel_request(&[1, 2, 3], ByteOrder::Little), None);
    }
}

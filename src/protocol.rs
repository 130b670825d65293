//! WebSocket message-level protocol handling
//!
//! [`Protocol`] sits on top of [`FrameParser`] and turns a client byte stream
//! into [`ParsedEvent`]s:
//! - Control frames are reported as soon as they complete, even in the
//!   middle of a fragmented message
//! - Data frames are reported one event per frame with their FIN flag
//! - Compressed messages are buffered until FIN and inflated once
//! - Text is validated incrementally across fragments
//!
//! The first violation produces a single [`ParsedEvent::Error`] carrying the
//! close code to answer with. After that the parser is halted and ignores
//! all further input.

use bytes::{Bytes, BytesMut};

use crate::Config;
use crate::deflate::{DeflateConfig, DeflateDecoder};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameParser, OpCode};
use crate::utf8::{Utf8Validator, validate_utf8};

/// Payload of a received close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code as sent by the peer (not yet range-checked)
    pub code: u16,
    /// UTF-8 reason
    pub reason: String,
}

/// A control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Ping with its application data
    Ping(Bytes),
    /// Pong with its application data
    Pong(Bytes),
    /// Close, `None` when the frame carried no status code
    Close(Option<CloseFrame>),
}

/// Event produced by [`Protocol::feed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// A complete control frame
    Control(Control),
    /// One data frame of the current message
    ///
    /// The first event of a message starts it, the event with `fin` set ends it.
    Data {
        /// Binary (true) or text (false) message
        binary: bool,
        /// Frame payload, inflated and validated where applicable
        payload: Bytes,
        /// Last frame of the message
        fin: bool,
    },
    /// Terminal violation; the connection must be closed with `code`
    Error {
        /// Close code to send
        code: u16,
        /// Close reason to send
        reason: String,
    },
}

/// Result of one [`Protocol::feed`] call
#[derive(Debug, Default)]
pub struct Parsed {
    /// Frames completed by this chunk
    pub frames: usize,
    /// Events in wire order
    pub events: Vec<ParsedEvent>,
}

/// Message currently being received
#[derive(Debug, Clone, Copy)]
struct InFlight {
    binary: bool,
    compressed: bool,
}

/// Server-side message parser for one connection
pub struct Protocol {
    parser: FrameParser,
    /// Bytes received but not yet consumed by the frame parser
    buffer: BytesMut,
    message: Option<InFlight>,
    /// Bytes received for the current message
    message_size: usize,
    max_message_size: usize,
    /// Compressed fragments waiting for FIN
    inflate_buf: BytesMut,
    decoder: Option<DeflateDecoder>,
    utf8: Option<Utf8Validator>,
    text_only: bool,
    halted: bool,
}

impl Protocol {
    /// Create a parser for a connection
    ///
    /// `deflate` carries the parameters negotiated during the handshake, if any.
    pub fn new(config: &Config, deflate: Option<&DeflateConfig>) -> Self {
        let parser = match deflate {
            Some(_) => FrameParser::with_compression(config.max_frame_size),
            None => FrameParser::new(config.max_frame_size),
        };

        Self {
            parser,
            buffer: BytesMut::new(),
            message: None,
            message_size: 0,
            max_message_size: config.max_message_size,
            inflate_buf: BytesMut::new(),
            decoder: deflate.map(DeflateConfig::decoder),
            utf8: config.validate_utf8.then(Utf8Validator::new),
            text_only: config.text_only,
            halted: false,
        }
    }

    /// Whether a violation stopped the parser
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Whether a fragmented message is in progress
    #[inline]
    pub fn in_message(&self) -> bool {
        self.message.is_some()
    }

    /// Feed a chunk of bytes read from the socket
    ///
    /// The chunk may hold any number of frames or a fraction of one. Partial
    /// frames are kept until the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Parsed {
        let mut parsed = Parsed::default();
        if self.halted {
            return parsed;
        }

        self.buffer.extend_from_slice(chunk);

        loop {
            let frame = match self.parser.parse(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if let Err(e) = self.check_pending_size() {
                        parsed.events.push(self.halt(e));
                    }
                    break;
                }
                Err(e) => {
                    parsed.events.push(self.halt(e));
                    break;
                }
            };

            parsed.frames += 1;
            match self.handle_frame(frame) {
                Ok(Some(event)) => parsed.events.push(event),
                Ok(None) => {}
                Err(e) => {
                    parsed.events.push(self.halt(e));
                    break;
                }
            }
        }

        parsed
    }

    /// Reject a data frame that would overflow the message limit as soon
    /// as its header is known
    fn check_pending_size(&self) -> Result<()> {
        match self.parser.pending_header() {
            Some(header)
                if header.opcode.is_data()
                    && self.message_size as u64 + header.payload_len
                        > self.max_message_size as u64 =>
            {
                Err(Error::MessageTooLarge)
            }
            _ => Ok(()),
        }
    }

    fn halt(&mut self, err: Error) -> ParsedEvent {
        self.halted = true;
        self.buffer.clear();
        self.inflate_buf.clear();
        self.message = None;

        ParsedEvent::Error {
            code: err.close_code(),
            reason: err.to_string(),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<ParsedEvent>> {
        match frame.opcode() {
            OpCode::Ping => Ok(Some(ParsedEvent::Control(Control::Ping(frame.payload)))),
            OpCode::Pong => Ok(Some(ParsedEvent::Control(Control::Pong(frame.payload)))),
            OpCode::Close => {
                let close = parse_close_payload(&frame.payload)?;
                Ok(Some(ParsedEvent::Control(Control::Close(close))))
            }
            OpCode::Text | OpCode::Binary => self.start_message(frame),
            OpCode::Continuation => self.data_frame(frame),
        }
    }

    fn start_message(&mut self, frame: Frame) -> Result<Option<ParsedEvent>> {
        if self.message.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }

        let binary = frame.opcode() == OpCode::Binary;
        if binary && self.text_only {
            return Err(Error::UnacceptableType);
        }

        self.message = Some(InFlight {
            binary,
            compressed: frame.header.rsv1,
        });
        self.data_frame(frame)
    }

    fn data_frame(&mut self, frame: Frame) -> Result<Option<ParsedEvent>> {
        let InFlight { binary, compressed } = self
            .message
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        self.message_size += frame.payload.len();
        if self.message_size > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        let fin = frame.is_final();

        let payload = if compressed {
            self.inflate_buf.extend_from_slice(&frame.payload);
            if !fin {
                return Ok(None);
            }
            let decoder = self
                .decoder
                .as_mut()
                .ok_or(Error::Protocol("compression not negotiated"))?;
            let deflated = self.inflate_buf.split();
            decoder.decompress(&deflated, self.max_message_size)?
        } else {
            frame.payload
        };

        let payload = match (&mut self.utf8, binary) {
            (Some(validator), false) => validator.feed(payload, fin)?,
            _ => payload,
        };

        if fin {
            self.message = None;
            self.message_size = 0;
        }

        Ok(Some(ParsedEvent::Data {
            binary,
            payload,
            fin,
        }))
    }
}

/// Decode a close frame payload
///
/// Empty payloads carry no status. A single byte is a protocol error and the
/// reason must be valid UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("invalid close frame payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = &payload[2..];
            if !validate_utf8(reason) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(CloseFrame {
                code,
                reason: String::from_utf8_lossy(reason).into_owned(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::CloseCode;
    use crate::frame::encode_frame;

    const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn frame(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(MASK));
        buf
    }

    fn fragmented(opcode: OpCode, payload: &[u8], parts: usize) -> BytesMut {
        let size = payload.len().div_ceil(parts).max(1);
        let chunks: Vec<&[u8]> = payload.chunks(size).collect();
        let mut buf = BytesMut::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let op = if i == 0 { opcode } else { OpCode::Continuation };
            buf.extend_from_slice(&frame(op, chunk, i + 1 == chunks.len()));
        }
        buf
    }

    fn collect_message(events: &[ParsedEvent]) -> (bool, Vec<u8>) {
        let mut out = Vec::new();
        let mut binary = false;
        for event in events {
            if let ParsedEvent::Data {
                binary: b,
                payload,
                ..
            } = event
            {
                binary = *b;
                out.extend_from_slice(payload);
            }
        }
        (binary, out)
    }

    #[test]
    fn test_single_text_frame() {
        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&frame(OpCode::Text, b"hello", true));

        assert_eq!(parsed.frames, 1);
        assert_eq!(
            parsed.events,
            vec![ParsedEvent::Data {
                binary: false,
                payload: Bytes::from_static(b"hello"),
                fin: true,
            }]
        );
        assert!(!protocol.in_message());
    }

    #[test]
    fn test_fragmentation_reassembles_identically() {
        let payload: Vec<u8> = "fragmented ✓ message body ".repeat(8).into_bytes();

        for parts in [1, 2, 10] {
            let mut protocol = Protocol::new(&Config::default(), None);
            let parsed = protocol.feed(&fragmented(OpCode::Text, &payload, parts));

            assert_eq!(parsed.frames, parts, "frame count for {parts}");
            let (binary, body) = collect_message(&parsed.events);
            assert!(!binary);
            assert_eq!(body, payload, "payload for {parts} parts");
            assert!(matches!(
                parsed.events.last(),
                Some(ParsedEvent::Data { fin: true, .. })
            ));
        }
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let wire = fragmented(OpCode::Binary, &[7u8; 500], 3);
        let mut protocol = Protocol::new(&Config::default(), None);

        let mut events = Vec::new();
        let mut frames = 0;
        for chunk in wire.chunks(7) {
            let parsed = protocol.feed(chunk);
            frames += parsed.frames;
            events.extend(parsed.events);
        }

        assert_eq!(frames, 3);
        let (binary, body) = collect_message(&events);
        assert!(binary);
        assert_eq!(body, vec![7u8; 500]);
    }

    #[test]
    fn test_control_frame_mid_message() {
        let mut wire = frame(OpCode::Text, b"hel", false);
        wire.extend_from_slice(&frame(OpCode::Ping, b"1", true));
        wire.extend_from_slice(&frame(OpCode::Continuation, b"lo", true));

        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&wire);

        assert_eq!(parsed.frames, 3);
        assert_eq!(
            parsed.events[1],
            ParsedEvent::Control(Control::Ping(Bytes::from_static(b"1")))
        );
        assert_eq!(collect_message(&parsed.events).1, b"hello");
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&frame(OpCode::Continuation, b"x", true));
        assert!(matches!(
            parsed.events[..],
            [ParsedEvent::Error { code: CloseCode::PROTOCOL_ERROR, .. }]
        ));
    }

    #[test]
    fn test_new_message_while_fragmented() {
        let mut wire = frame(OpCode::Text, b"a", false);
        wire.extend_from_slice(&frame(OpCode::Binary, b"b", true));

        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&wire);
        assert!(matches!(
            parsed.events.last(),
            Some(ParsedEvent::Error { code: CloseCode::PROTOCOL_ERROR, .. })
        ));
    }

    #[test]
    fn test_halts_after_error() {
        let mut wire = BytesMut::from(&[0x83, 0x80, 0, 0, 0, 0][..]);
        wire.extend_from_slice(&frame(OpCode::Text, b"after", true));

        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&wire);
        assert_eq!(parsed.events.len(), 1);
        assert!(protocol.is_halted());

        let parsed = protocol.feed(&frame(OpCode::Text, b"later", true));
        assert_eq!(parsed.frames, 0);
        assert!(parsed.events.is_empty());
    }

    #[test]
    fn test_cumulative_message_size() {
        let config = Config::builder().max_message_size(10).build();
        let mut wire = frame(OpCode::Binary, &[0u8; 6], false);
        wire.extend_from_slice(&frame(OpCode::Continuation, &[0u8; 6], true));

        let mut protocol = Protocol::new(&config, None);
        let parsed = protocol.feed(&wire);
        assert!(matches!(
            parsed.events.last(),
            Some(ParsedEvent::Error { code: CloseCode::MESSAGE_TOO_LARGE, .. })
        ));
    }

    #[test]
    fn test_oversized_continuation_rejected_at_header() {
        let config = Config::builder().max_message_size(10).build();
        let mut protocol = Protocol::new(&config, None);
        let parsed = protocol.feed(&frame(OpCode::Binary, &[0u8; 6], false));
        assert_eq!(parsed.events.len(), 1);

        // Only the header of the next fragment has arrived
        let next = frame(OpCode::Continuation, &[0u8; 6], true);
        let parsed = protocol.feed(&next[..6]);
        assert!(matches!(
            parsed.events.as_slice(),
            [ParsedEvent::Error { code: CloseCode::MESSAGE_TOO_LARGE, .. }]
        ));
        assert!(protocol.is_halted());
    }

    #[test]
    fn test_size_resets_after_fin() {
        let config = Config::builder().max_message_size(10).build();
        let mut wire = frame(OpCode::Binary, &[0u8; 8], true);
        wire.extend_from_slice(&frame(OpCode::Binary, &[0u8; 8], true));

        let mut protocol = Protocol::new(&config, None);
        let parsed = protocol.feed(&wire);
        assert_eq!(parsed.events.len(), 2);
        assert!(!protocol.is_halted());
    }

    #[test]
    fn test_text_only_rejects_binary() {
        let config = Config::builder().text_only(true).build();
        let mut protocol = Protocol::new(&config, None);
        let parsed = protocol.feed(&frame(OpCode::Binary, b"\x00", true));
        assert!(matches!(
            parsed.events[..],
            [ParsedEvent::Error { code: CloseCode::UNACCEPTABLE_TYPE, .. }]
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&frame(OpCode::Text, &[0xC0, 0x80], true));
        assert!(matches!(
            parsed.events[..],
            [ParsedEvent::Error { code: CloseCode::INCONSISTENT_FRAME_DATA_TYPE, .. }]
        ));

        let config = Config::builder().validate_utf8(false).build();
        let mut protocol = Protocol::new(&config, None);
        let parsed = protocol.feed(&frame(OpCode::Text, &[0xC0, 0x80], true));
        assert!(matches!(parsed.events[..], [ParsedEvent::Data { .. }]));
    }

    #[test]
    fn test_code_point_split_across_fragments() {
        let check = "✓".as_bytes();
        let mut wire = frame(OpCode::Text, &check[..1], false);
        wire.extend_from_slice(&frame(OpCode::Continuation, &check[1..], true));

        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&wire);
        assert_eq!(collect_message(&parsed.events).1, check);
    }

    #[test]
    fn test_compressed_message() {
        let deflate = DeflateConfig {
            compression_threshold: 0,
            ..Default::default()
        };
        let original = "compressible ".repeat(50);
        let compressed = deflate
            .encoder()
            .compress(original.as_bytes())
            .unwrap()
            .unwrap();

        // Split the compressed payload over two frames, RSV1 on the first only
        let (first, second) = compressed.split_at(compressed.len() / 2);
        let mut wire = BytesMut::new();
        crate::frame::encode_frame_with_rsv(&mut wire, OpCode::Text, first, false, Some(MASK), true);
        wire.extend_from_slice(&frame(OpCode::Continuation, second, true));

        let mut protocol = Protocol::new(&Config::default(), Some(&deflate));
        let parsed = protocol.feed(&wire);

        assert_eq!(parsed.frames, 2);
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(collect_message(&parsed.events).1, original.as_bytes());
    }

    #[test]
    fn test_close_payloads() {
        assert_eq!(parse_close_payload(&[]).unwrap(), None);
        assert!(parse_close_payload(&[0x03]).is_err());

        let close = parse_close_payload(b"\x03\xe8bye").unwrap().unwrap();
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "bye");

        assert!(matches!(
            parse_close_payload(&[0x03, 0xe8, 0xC0, 0x80]),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn test_close_event() {
        let mut protocol = Protocol::new(&Config::default(), None);
        let parsed = protocol.feed(&frame(OpCode::Close, b"\x0b\xb8app", true));
        assert_eq!(
            parsed.events,
            vec![ParsedEvent::Control(Control::Close(Some(CloseFrame {
                code: 3000,
                reason: "app".into(),
            })))]
        );
    }
}

//! WebSocket frame parsing and serialization
//!
//! RFC 6455 section 5 framing for the server side of a connection:
//! - Resumable parsing across arbitrary read boundaries
//! - Client frames carrying a payload must be masked
//! - Server frames are never masked
//! - Fast path for small frames (< 126 bytes)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    ///
    /// Returns `None` for the reserved ranges 0x3-0x7 and 0xB-0xF.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (set on the first frame of a compressed message)
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

/// A complete WebSocket frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }
}

/// Frame parser state machine
#[derive(Debug, Clone)]
enum ParseState {
    /// Waiting for a complete header (2-14 bytes)
    Header,
    /// Header parsed, waiting for the payload
    Payload(FrameHeader),
}

/// Incremental frame parser for client-to-server traffic
///
/// Bytes are appended to a caller-owned buffer and `parse` is called until it
/// returns `Ok(None)`. Partial headers and payloads stay in the buffer, so a
/// frame may span any number of reads and a single read may hold many frames.
///
/// Once `parse` returns an error the parser must not be used again.
pub struct FrameParser {
    state: ParseState,
    /// Maximum frame payload size
    max_frame_size: usize,
    /// Whether RSV1 is allowed (compression negotiated)
    allow_rsv1: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: ParseState::Header,
            max_frame_size,
            allow_rsv1: false,
        }
    }

    /// Create a new frame parser that accepts RSV1 on data frames
    pub fn with_compression(max_frame_size: usize) -> Self {
        Self {
            allow_rsv1: true,
            ..Self::new(max_frame_size)
        }
    }

    /// Header of the frame whose payload is still being buffered
    pub fn pending_header(&self) -> Option<&FrameHeader> {
        match &self.state {
            ParseState::Payload(header) => Some(header),
            ParseState::Header => None,
        }
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) if the frame violates the protocol or size limits
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if let ParseState::Header = self.state {
            match self.parse_header(buf)? {
                Some(header) => self.state = ParseState::Payload(header),
                None => return Ok(None),
            }
        }

        let payload_len = match &self.state {
            ParseState::Payload(header) => header.payload_len as usize,
            ParseState::Header => return Ok(None),
        };
        if buf.len() < payload_len {
            return Ok(None);
        }

        let ParseState::Payload(header) = std::mem::replace(&mut self.state, ParseState::Header)
        else {
            return Ok(None);
        };

        let mut payload = buf.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    /// Decode the header once all of its bytes are buffered
    ///
    /// Violations detectable from the first two bytes are reported as soon as
    /// those bytes arrive.
    fn parse_header(&self, buf: &mut BytesMut) -> Result<Option<FrameHeader>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv23 = b0 & 0x30 != 0;

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("reserved opcode"))?;

        if rsv23 {
            return Err(Error::Protocol("RSV2 and RSV3 must be 0"));
        }
        if rsv1 {
            let data_start = matches!(opcode, OpCode::Text | OpCode::Binary);
            if !data_start {
                return Err(Error::Protocol("RSV1 set on control or continuation frame"));
            }
            if !self.allow_rsv1 {
                return Err(Error::Protocol("RSV1 must be 0 (compression not negotiated)"));
            }
        }

        let masked = b1 & 0x80 != 0;
        let len_byte = b1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if len_byte as usize > MAX_CONTROL_PAYLOAD {
                return Err(Error::Protocol("control frame too large"));
            }
        }

        let len_size = match len_byte {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask_size = if masked { 4 } else { 0 };
        let header_size = 2 + len_size + mask_size;

        if buf.len() < header_size {
            return Ok(None);
        }

        let payload_len = match len_byte {
            126 => {
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                len
            }
            127 => {
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be 0"));
                }
                if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                len
            }
            len => len as u64,
        };

        if payload_len > 0 && !masked {
            return Err(Error::Protocol("client frames must be masked"));
        }

        if payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let mask = masked.then(|| {
            let at = 2 + len_size;
            [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
        });

        buf.advance(header_size);

        Ok(Some(FrameHeader {
            fin,
            rsv1,
            opcode,
            payload_len,
            mask,
        }))
    }
}

/// Size of the header `encode_frame` writes for a payload
#[inline]
pub fn header_size(payload_len: usize, masked: bool) -> usize {
    let len_size = if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    };
    2 + len_size + if masked { 4 } else { 0 }
}

/// Encode a frame into a buffer
///
/// Server frames pass `None` as the mask. A mask is only supplied when
/// producing client traffic, e.g. in tests and benchmarks.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, mask, false)
}

/// Encode a frame with RSV1 bit control (for compression)
///
/// When `rsv1` is true, sets the RSV1 bit indicating compressed data.
pub fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    rsv1: bool,
) {
    let payload_len = payload.len();

    buf.reserve(header_size(payload_len, mask.is_some()) + payload_len);

    // First byte: FIN + RSV1 + opcode
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    buf.put_u8(b0);

    // Second byte: mask flag + length
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn masked(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(MASK));
        buf
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
    }

    #[test]
    fn test_round_trip_text_and_binary() {
        for opcode in [OpCode::Text, OpCode::Binary] {
            for payload in [&b""[..], b"x", b"hello world"] {
                let mut parser = FrameParser::new(1024);
                let mut buf = masked(opcode, payload, true);

                let frame = parser.parse(&mut buf).unwrap().unwrap();
                assert_eq!(frame.opcode(), opcode);
                assert!(frame.is_final());
                assert_eq!(frame.payload.as_ref(), payload);
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_parse_masked_abc() {
        let mut parser = FrameParser::new(1024);
        let mask = [0x12, 0x34, 0x56, 0x78];

        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x83);
        buf.put_slice(&mask);
        buf.put_slice(&[b'a' ^ 0x12, b'b' ^ 0x34, b'c' ^ 0x56]);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"abc");
    }

    #[test]
    fn test_length_field_escalation() {
        for (len, expected_header) in [(0, 2), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let payload = vec![0x42u8; len];

            let mut unmasked = BytesMut::new();
            encode_frame(&mut unmasked, OpCode::Binary, &payload, true, None);
            assert_eq!(unmasked.len(), expected_header + len, "header for {len}");
            match expected_header {
                2 => assert_eq!(unmasked[1] as usize, len),
                4 => assert_eq!(unmasked[1], 126),
                _ => assert_eq!(unmasked[1], 127),
            }

            let mut parser = FrameParser::new(1 << 20);
            let mut buf = masked(OpCode::Binary, &payload, true);
            let frame = parser.parse(&mut buf).unwrap().unwrap();
            assert_eq!(frame.header.payload_len, len as u64);
            assert_eq!(frame.payload.as_ref(), &payload[..]);
        }
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let payload = vec![0x5Au8; 300];
        let wire = masked(OpCode::Text, &payload, true);

        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = parser.parse(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), &payload[..]);
    }

    #[test]
    fn test_parse_many_frames_in_one_chunk() {
        let mut buf = masked(OpCode::Text, b"one", true);
        buf.extend_from_slice(&masked(OpCode::Ping, b"", true));
        buf.extend_from_slice(&masked(OpCode::Binary, b"two", true));

        let mut parser = FrameParser::new(1024);
        let mut opcodes = Vec::new();
        while let Some(frame) = parser.parse(&mut buf).unwrap() {
            opcodes.push(frame.opcode());
        }
        assert_eq!(opcodes, vec![OpCode::Text, OpCode::Ping, OpCode::Binary]);
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        for opcode in [3u8, 4, 5, 6, 7, 11, 12, 13, 14, 15] {
            let mut parser = FrameParser::new(1024);
            let mut buf = BytesMut::from(&[0x80 | opcode, 0x80, 0, 0, 0, 0][..]);
            let err = parser.parse(&mut buf).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "opcode {opcode}");
            assert_eq!(err.close_code(), crate::CloseCode::PROTOCOL_ERROR);
        }
    }

    #[test]
    fn test_unmasked_payload_rejected() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);
        let err = parser.parse(&mut buf).unwrap_err();
        assert_eq!(err.close_code(), crate::CloseCode::PROTOCOL_ERROR);
    }

    #[test]
    fn test_unmasked_empty_frame_accepted() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x89, 0x00][..]);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Ping);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_control_frame_fragmentation() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0x09, 0x80, 0, 0, 0, 0][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_control_frame_too_large() {
        let mut parser = FrameParser::new(1024);
        let mut buf = masked(OpCode::Ping, &[0u8; 126], true);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_rsv_bits() {
        // RSV1 without compression
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::from(&[0xC1, 0x80, 0, 0, 0, 0][..]);
        assert!(parser.parse(&mut buf).is_err());

        // RSV1 with compression on a text frame
        let mut parser = FrameParser::with_compression(1024);
        let mut buf = BytesMut::from(&[0xC1, 0x80, 0, 0, 0, 0][..]);
        assert!(parser.parse(&mut buf).unwrap().unwrap().header.rsv1);

        // RSV1 on a continuation frame
        let mut parser = FrameParser::with_compression(1024);
        let mut buf = BytesMut::from(&[0xC0, 0x80, 0, 0, 0, 0][..]);
        assert!(parser.parse(&mut buf).is_err());

        // RSV2
        let mut parser = FrameParser::with_compression(1024);
        let mut buf = BytesMut::from(&[0xA1, 0x80, 0, 0, 0, 0][..]);
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn test_length_msb_rejected() {
        let mut parser = FrameParser::new(usize::MAX);
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(0x80 | 127);
        buf.put_u64(1 << 63);
        buf.put_slice(&MASK);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_non_minimal_length_rejected() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(0x80 | 126);
        buf.put_u16(5);
        buf.put_slice(&MASK);
        buf.put_slice(&[0u8; 5]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(100);
        let mut buf = masked(OpCode::Binary, &[0u8; 101], true);
        let err = parser.parse(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge));
        assert_eq!(err.close_code(), crate::CloseCode::MESSAGE_TOO_LARGE);
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hello", true, None);

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x05);
        assert_eq!(&buf[2..], b"hello");
    }

    #[test]
    fn test_encode_rsv1_and_continuation() {
        let mut buf = BytesMut::new();
        encode_frame_with_rsv(&mut buf, OpCode::Text, b"a", false, None, true);
        assert_eq!(buf[0], 0x41);

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Continuation, b"b", true, None);
        assert_eq!(buf[0], 0x80);
    }
}

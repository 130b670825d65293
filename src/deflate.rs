//! Per-Message Deflate Extension (RFC 7692)
//!
//! Negotiation of the `permessage-deflate` offer during the handshake and the
//! per-connection compressor/decompressor. The decoder lives with the read
//! side of a connection and the encoder with the write side.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Trailer bytes that must be removed after compression and added before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size a peer may request (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Smallest window the compressor can run with
const MIN_ENCODER_WINDOW_BITS: u8 = 9;

/// permessage-deflate parameters
///
/// As part of [`Config`](crate::Config) this holds the server's preferences.
/// After negotiation it holds the agreed parameters for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// LZ77 window bits the server compresses with
    pub server_max_window_bits: u8,
    /// LZ77 window bits the client compresses with
    pub client_max_window_bits: u8,
    /// Server resets its compressor after each message
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9, where 0 is no compression, 9 is max)
    pub compression_level: u32,
    /// Messages smaller than this are sent uncompressed
    pub compression_threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
            compression_threshold: 32,
        }
    }
}

impl DeflateConfig {
    /// Agree on parameters for one offer
    ///
    /// Returns `None` when the offer carries an unknown, duplicated or
    /// malformed parameter, or asks for something the server cannot honor.
    pub fn accept(&self, params: &[(&str, Option<&str>)]) -> Option<Self> {
        let mut agreed = Self {
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            ..self.clone()
        };
        let mut seen: Vec<&str> = Vec::with_capacity(params.len());

        for (name, value) in params {
            if seen.contains(name) {
                return None;
            }
            seen.push(name);

            match *name {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return None;
                    }
                    agreed.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return None;
                    }
                    agreed.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let bits = parse_window_bits((*value)?)?;
                    // The compressor cannot produce a 256-byte window
                    if bits < MIN_ENCODER_WINDOW_BITS {
                        return None;
                    }
                    agreed.server_max_window_bits = bits.min(self.server_max_window_bits);
                }
                "client_max_window_bits" => {
                    let limit = match value {
                        Some(v) => parse_window_bits(v)?,
                        None => MAX_WINDOW_BITS,
                    };
                    agreed.client_max_window_bits = limit.min(self.client_max_window_bits);
                }
                _ => return None,
            }
        }

        agreed.server_max_window_bits = agreed.server_max_window_bits.max(MIN_ENCODER_WINDOW_BITS);
        Some(agreed)
    }

    /// Generate the `Sec-WebSocket-Extensions` response value
    pub fn to_response_header(&self) -> String {
        let mut parts = vec![EXTENSION_NAME.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }

        parts.join("; ")
    }

    /// Compressor for server-to-client messages
    pub fn encoder(&self) -> DeflateEncoder {
        DeflateEncoder::new(
            self.server_max_window_bits,
            self.server_no_context_takeover,
            self.compression_level,
            self.compression_threshold,
        )
    }

    /// Decompressor for client-to-server messages
    pub fn decoder(&self) -> DeflateDecoder {
        DeflateDecoder::new(self.client_no_context_takeover)
    }
}

fn parse_window_bits(value: &str) -> Option<u8> {
    let bits: u8 = value.parse().ok()?;
    (MIN_WINDOW_BITS..=MAX_WINDOW_BITS)
        .contains(&bits)
        .then_some(bits)
}

/// Negotiate permessage-deflate from a `Sec-WebSocket-Extensions` value
///
/// Offers are tried in order and the first acceptable one wins. Offers for
/// other extensions and offers that cannot be accepted are skipped.
pub fn negotiate(header: &str, local: &DeflateConfig) -> Option<DeflateConfig> {
    header
        .split(',')
        .filter_map(parse_deflate_offer)
        .find_map(|params| local.accept(&params))
}

/// Parse one permessage-deflate offer into its parameters
///
/// Returns `None` when the offer names a different extension.
pub fn parse_deflate_offer(offer: &str) -> Option<Vec<(&str, Option<&str>)>> {
    let mut parts = offer.split(';');
    let name = parts.next()?.trim();
    if !name.eq_ignore_ascii_case(EXTENSION_NAME) {
        return None;
    }

    let params = parts
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (part, None),
        })
        .collect();

    Some(params)
}

/// Deflate compressor for outgoing messages
pub struct DeflateEncoder {
    compress: Compress,
    no_context_takeover: bool,
    threshold: usize,
}

impl DeflateEncoder {
    /// Create a new encoder
    ///
    /// Window bits below 9 are raised to 9.
    pub fn new(window_bits: u8, no_context_takeover: bool, level: u32, threshold: usize) -> Self {
        let window_bits = window_bits.clamp(MIN_ENCODER_WINDOW_BITS, MAX_WINDOW_BITS);
        let compress = Compress::new_with_window_bits(Compression::new(level), false, window_bits);

        Self {
            compress,
            no_context_takeover,
            threshold,
        }
    }

    /// Compress a message payload
    ///
    /// Returns `None` for messages below the threshold. With context takeover
    /// the compressed form is always used once the data has entered the
    /// window, otherwise the peer's inflater would fall out of step.
    pub fn compress(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.threshold {
            return Ok(None);
        }

        if self.no_context_takeover {
            self.compress.reset();
        }

        let mut output = Vec::with_capacity(data.len() + 64);
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }

            let before_in = self.compress.total_in();
            self.compress
                .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;
            consumed += (self.compress.total_in() - before_in) as usize;

            // A sync flush is complete once all input is in and output has room left
            if consumed >= data.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        if self.no_context_takeover && output.len() >= data.len() {
            return Ok(None);
        }

        Ok(Some(Bytes::from(output)))
    }
}

/// Deflate decompressor for incoming messages
pub struct DeflateDecoder {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl DeflateDecoder {
    /// Create a new decoder
    ///
    /// The decoder always runs with the largest window, which can inflate
    /// anything produced with a smaller one.
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new_with_window_bits(false, MAX_WINDOW_BITS),
            no_context_takeover,
        }
    }

    /// Decompress a complete message payload
    ///
    /// Fails with [`Error::MessageTooLarge`] as soon as the inflated size
    /// exceeds `max_size`.
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        if self.no_context_takeover {
            self.decompress.reset(false);
        }

        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let initial = (data.len() * 4).clamp(1024, max_size.saturating_add(1).max(1024));
        let mut output = Vec::with_capacity(initial);
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {e}")))?;
            let read = (self.decompress.total_in() - before_in) as usize;
            let written = (self.decompress.total_out() - before_out) as usize;
            consumed += read;

            if output.len() > max_size {
                return Err(Error::MessageTooLarge);
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    let has_room = output.len() < output.capacity();
                    if consumed >= input.len() && has_room {
                        break;
                    }
                    if read == 0 && written == 0 && has_room {
                        return Err(Error::Compression("inflate made no progress".into()));
                    }
                }
            }
        }

        Ok(Bytes::from(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreed(config: &DeflateConfig) -> (DeflateEncoder, DeflateDecoder) {
        let encoder = config.encoder();
        // The peer decodes what the server encodes, so mirror the server side
        let decoder = DeflateDecoder::new(config.server_no_context_takeover);
        (encoder, decoder)
    }

    #[test]
    fn test_compress_decompress() {
        let (mut encoder, mut decoder) = agreed(&DeflateConfig::default());
        let original = b"Hello, World! This is a test message that should be compressed.";

        let compressed = encoder.compress(original).unwrap().unwrap();
        assert!(compressed.len() < original.len());
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));

        let decompressed = decoder.decompress(&compressed, 1024).unwrap();
        assert_eq!(&decompressed[..], &original[..]);
    }

    #[test]
    fn test_small_message_not_compressed() {
        let config = DeflateConfig {
            compression_threshold: 100,
            ..Default::default()
        };
        assert!(config.encoder().compress(b"tiny").unwrap().is_none());
    }

    #[test]
    fn test_context_takeover_across_messages() {
        let config = DeflateConfig {
            compression_threshold: 0,
            ..Default::default()
        };
        let (mut encoder, mut decoder) = agreed(&config);
        let msg = b"Hello, World! Hello, World! Hello, World!";

        let first = encoder.compress(msg).unwrap().unwrap();
        let second = encoder.compress(msg).unwrap().unwrap();
        assert!(second.len() <= first.len());

        assert_eq!(&decoder.decompress(&first, 1024).unwrap()[..], msg);
        assert_eq!(&decoder.decompress(&second, 1024).unwrap()[..], msg);
    }

    #[test]
    fn test_no_context_takeover() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            compression_threshold: 0,
            ..Default::default()
        };
        let mut encoder = config.encoder();
        let msg = b"Hello, World! Hello, World! Hello, World!";

        let first = encoder.compress(msg).unwrap().unwrap();
        let second = encoder.compress(msg).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decompress_size_limit() {
        let config = DeflateConfig {
            compression_threshold: 0,
            ..Default::default()
        };
        let (mut encoder, mut decoder) = agreed(&config);
        let big = vec![b'a'; 64 * 1024];
        let compressed = encoder.compress(&big).unwrap().unwrap();

        let result = decoder.decompress(&compressed, 1024);
        assert!(matches!(result, Err(Error::MessageTooLarge)));
    }

    #[test]
    fn test_decompress_garbage() {
        let mut decoder = DeflateDecoder::new(false);
        let result = decoder.decompress(&[0xff, 0xff, 0xff, 0xff, 0xff], 1024);
        assert!(matches!(result, Err(Error::Compression(_))));
    }

    #[test]
    fn test_parse_deflate_offer() {
        let params = parse_deflate_offer("permessage-deflate").unwrap();
        assert!(params.is_empty());

        let params = parse_deflate_offer(
            " permessage-deflate; server_no_context_takeover; server_max_window_bits=10",
        )
        .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("server_no_context_takeover", None));
        assert_eq!(params[1], ("server_max_window_bits", Some("10")));

        assert!(parse_deflate_offer("some-other-extension").is_none());
        assert!(parse_deflate_offer("permessage-deflate-x").is_none());
    }

    #[test]
    fn test_accept_params() {
        let local = DeflateConfig::default();
        let config = local
            .accept(&[
                ("server_no_context_takeover", None),
                ("client_max_window_bits", Some("12")),
            ])
            .unwrap();
        assert!(config.server_no_context_takeover);
        assert!(!config.client_no_context_takeover);
        assert_eq!(config.client_max_window_bits, 12);
        assert_eq!(config.server_max_window_bits, DEFAULT_WINDOW_BITS);
    }

    #[test]
    fn test_accept_rejects_bad_params() {
        let local = DeflateConfig::default();
        assert!(local.accept(&[("unknown", None)]).is_none());
        assert!(local.accept(&[("server_max_window_bits", None)]).is_none());
        assert!(local.accept(&[("server_max_window_bits", Some("16"))]).is_none());
        assert!(local.accept(&[("server_max_window_bits", Some("8"))]).is_none());
        assert!(local.accept(&[("server_no_context_takeover", Some("1"))]).is_none());
        assert!(
            local
                .accept(&[("client_no_context_takeover", None), ("client_no_context_takeover", None)])
                .is_none()
        );
    }

    #[test]
    fn test_negotiate_first_acceptable_offer() {
        let local = DeflateConfig::default();
        let header = "x-webkit-deflate-frame, permessage-deflate; foo=1, \
                      permessage-deflate; server_max_window_bits=11, permessage-deflate";
        let config = negotiate(header, &local).unwrap();
        assert_eq!(config.server_max_window_bits, 11);

        assert!(negotiate("permessage-deflate; bogus", &local).is_none());
        assert!(negotiate("x-webkit-deflate-frame", &local).is_none());
    }

    #[test]
    fn test_response_header() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            server_max_window_bits: 12,
            ..Default::default()
        };

        assert_eq!(
            config.to_response_header(),
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=12"
        );
        assert_eq!(
            DeflateConfig::default().to_response_header(),
            "permessage-deflate"
        );
    }
}

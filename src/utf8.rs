//! UTF-8 validation for text messages
//!
//! Whole buffers are validated with `simdutf8`. Fragmented messages use
//! [`Utf8Validator`], which validates each fragment as it arrives and carries
//! an incomplete trailing code point over to the next fragment.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Longest prefix of a code point that can be left incomplete
const MAX_PENDING: usize = 3;

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Check whether `data` is valid UTF-8 apart from an incomplete tail
///
/// Returns:
/// - `Some(n)` when every complete sequence is valid, where `n` is the number
///   of trailing bytes forming an incomplete sequence (0-3)
/// - `None` when an invalid sequence is present
pub fn incomplete_tail(data: &[u8]) -> Option<usize> {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => Some(0),
        // error_len == None: the input ended in the middle of a sequence
        Err(e) if e.error_len().is_none() => Some(data.len() - e.valid_up_to()),
        Err(_) => None,
    }
}

/// Incremental validator for a text message split across frames
#[derive(Debug, Default)]
pub struct Utf8Validator {
    pending: BytesMut,
}

impl Utf8Validator {
    /// Create an empty validator
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the next fragment
    ///
    /// Returns the bytes that form complete code points, including any bytes
    /// held back from the previous fragment. On a non-final fragment up to 3
    /// trailing bytes of an unfinished code point are held back. On the final
    /// fragment nothing may remain incomplete.
    pub fn feed(&mut self, fragment: Bytes, fin: bool) -> Result<Bytes> {
        let data = if self.pending.is_empty() {
            fragment
        } else {
            self.pending.extend_from_slice(&fragment);
            self.pending.split().freeze()
        };

        let tail = incomplete_tail(&data).ok_or(Error::InvalidUtf8)?;

        if tail == 0 {
            return Ok(data);
        }
        if fin || tail > MAX_PENDING {
            return Err(Error::InvalidUtf8);
        }

        let split = data.len() - tail;
        self.pending.extend_from_slice(&data[split..]);
        Ok(data.slice(..split))
    }

    /// Number of bytes currently held back
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

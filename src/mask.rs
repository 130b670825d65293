//! WebSocket frame masking
//!
//! Client-to-server frames carry a 4-byte key that is XORed over the payload,
//! cycling every 4 bytes. Masking and unmasking are the same operation.

/// Apply a WebSocket mask in place
///
/// Processes 8 bytes at a time and finishes the tail byte by byte. The key
/// position is continuous across the whole slice.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let wide = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let value = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }

    // Each full chunk is a multiple of 4, so the tail starts at key index 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_abc() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut data = *b"abc";
        apply_mask(&mut data, mask);
        assert_eq!(data, [b'a' ^ 0x12, b'b' ^ 0x34, b'c' ^ 0x56]);

        apply_mask(&mut data, mask);
        assert_eq!(&data, b"abc");
    }

    #[test]
    fn test_mask_cycles_every_four_bytes() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut data = vec![0u8; 13];
        apply_mask(&mut data, mask);
        assert_eq!(
            data,
            vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4, 1],
        );
    }

    #[test]
    fn test_mask_empty() {
        let mut data: Vec<u8> = Vec::new();
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert!(data.is_empty());
    }

    #[test]
    fn test_mask_involution_various_lengths() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        for len in [1, 7, 8, 9, 15, 16, 17, 1000] {
            let original: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut data = original.clone();
            apply_mask(&mut data, mask);
            apply_mask(&mut data, mask);
            assert_eq!(data, original, "failed for length {len}");
        }
    }
}

//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking is an involution: applying the same key twice restores the input.

/// Mask/unmask a payload in place.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast64(buf, mask);
}

/// Masks `buf` as the slice of a payload that starts at byte `offset`.
#[inline]
pub fn apply_mask_at(buf: &mut [u8], mut mask: [u8; 4], offset: usize) {
    mask.rotate_left(offset & 3);
    apply_mask_fast64(buf, mask);
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Word-at-a-time variant which XORs eight bytes per iteration.
///
/// The key is replicated into a 64-bit word; since 8 is a multiple of 4 the
/// key phase is the same at the start of every chunk, so the remaining tail
/// (fewer than 8 bytes) is handled by the byte loop starting at phase 0.
#[inline]
pub fn apply_mask_fast64(buf: &mut [u8], mask: [u8; 4]) {
    let mut wide = [0u8; 8];
    wide[..4].copy_from_slice(&mask);
    wide[4..].copy_from_slice(&mask);
    let mask_u64 = u64::from_ne_bytes(wide);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    apply_mask_fallback(chunks.into_remainder(), mask);
}

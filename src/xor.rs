//! GF(2) block arithmetic.
//!
//! Addition in GF(2) is bitwise XOR, so "adding" or "subtracting" a source
//! block's contribution to an encoded payload is the same byte-wise XOR.
//!
//! # Parallel merge
//!
//! With the `parallel` feature enabled, payloads of at least
//! [`PARALLEL_THRESHOLD`] bytes are split into [`PARALLEL_CHUNK`]-sized
//! slices and merged concurrently using Rayon.  Shorter payloads always take
//! the sequential path; the split costs more than it saves below the
//! threshold.

/// Payloads shorter than this are always merged sequentially.
pub const PARALLEL_THRESHOLD: usize = 256 * 1024;
/// Slice size handed to each Rayon task.
pub const PARALLEL_CHUNK:     usize = 64 * 1024;

/// Return a new buffer holding `a[i] ^ b[i]` for `i` in `[0, length)`.
///
/// Both inputs must hold at least `length` bytes.
pub fn merge(a: &[u8], b: &[u8], length: usize) -> Vec<u8> {
    let mut out = a[..length].to_vec();
    merge_in_place(&mut out, &b[..length]);
    out
}

/// XOR `src` into `dst` byte by byte.  Only the common prefix is touched.
pub fn merge_in_place(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..n], &src[..n]);

    #[cfg(feature = "parallel")]
    {
        if n >= PARALLEL_THRESHOLD {
            use rayon::prelude::*;

            dst.par_chunks_mut(PARALLEL_CHUNK)
                .zip(src.par_chunks(PARALLEL_CHUNK))
                .for_each(|(d, s)| xor_slice(d, s));
            return;
        }
    }

    xor_slice(dst, src);
}

#[inline]
fn xor_slice(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

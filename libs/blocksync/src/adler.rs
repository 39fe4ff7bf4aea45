//! Adler-32 rolling checksum, per RFC 1950 with the NMAX batching trick so the
//! bulk computation never needs a `%` per byte in its inner loop.

const BASE: u32 = 65521;
const NMAX: usize = 5552;
const INITIAL: u32 = 1;

/// Computes Adler-32 over `data`, continuing from `seed` (pass [`INITIAL`]
/// for a fresh checksum, or a prior value to extend it).
pub fn adler32(seed: u32, data: &[u8]) -> u32 {
    let mut a = seed & 0xffff;
    let mut b = seed >> 16;
    let mut chunks = data.chunks(NMAX);
    for chunk in &mut chunks {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= BASE;
        b %= BASE;
    }
    a | (b << 16)
}

/// Returns the checksum for a fresh (non-seeded) buffer.
pub fn adler32_fresh(data: &[u8]) -> u32 {
    adler32(INITIAL, data)
}

/// Advances a window-sized Adler-32 by one byte: `byte_out` leaves the
/// window, `byte_in` enters it. `len` is the (constant) window length.
pub fn adler32_roll(adler: u32, byte_out: u8, byte_in: u8, len: u32) -> u32 {
    let mut a = adler & 0xffff;
    let b = adler >> 16;
    a = a
        .wrapping_add(BASE)
        .wrapping_add(byte_in as u32)
        .wrapping_sub(byte_out as u32);
    let b = ((BASE as u64) * (BASE as u64) + b as u64 + a as u64
        - (len as u64) * (byte_out as u64)
        - INITIAL as u64)
        % BASE as u64;
    a %= BASE;
    a | ((b as u32) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_matches_fresh_computation() {
        let data = b"the quick brown fox jumps over the lazy dog, twice over";
        let window = 8usize;
        let mut adler = adler32_fresh(&data[0..window]);
        for i in 0..(data.len() - window) {
            let expected = adler32_fresh(&data[i + 1..i + 1 + window]);
            adler = adler32_roll(adler, data[i], data[i + window], window as u32);
            assert_eq!(adler, expected, "mismatch rolling past offset {i}");
        }
    }

    #[test]
    fn empty_buffer_is_initial() {
        assert_eq!(adler32_fresh(&[]), INITIAL);
    }

    #[test]
    fn large_buffer_crosses_nmax_boundary() {
        let data = vec![7u8; NMAX * 3 + 17];
        // Just check it doesn't panic and is stable across re-computation.
        let a = adler32_fresh(&data);
        let b = adler32_fresh(&data);
        assert_eq!(a, b);
    }
}

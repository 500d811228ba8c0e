//! Reversible byte obfuscation for the fallback upload transport.
//!
//! Some networks interfere with recognisable compressed payloads. The
//! munged endpoint accepts the same bytes XORed with [`MUNGE_KEY`]; the
//! receiver applies the same transform to recover them.

use bytes::{Bytes, BytesMut};

use crate::constants::MUNGE_KEY;

/// XOR every byte in place. Applying it twice restores the input.
pub fn munge_buffer(buffer: &mut [u8]) {
    for b in buffer.iter_mut() {
        *b ^= MUNGE_KEY;
    }
}

/// Munged copy of `data`.
pub fn munged(data: &[u8]) -> Bytes {
    let mut out = BytesMut::from(data);
    munge_buffer(&mut out);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_munge_is_involution() {
        let original = b"compressed-payload \x00\xff".to_vec();
        let mut buf = original.clone();
        munge_buffer(&mut buf);
        assert_ne!(buf, original);
        munge_buffer(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_munged_copy_leaves_input() {
        let data = [0u8, 1, 42];
        let out = munged(&data);
        assert_eq!(&out[..], &[42, 43, 0]);
        assert_eq!(data, [0, 1, 42]);
    }
}

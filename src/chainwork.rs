use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Work carried by a block with the compact target `n_bits`:
/// floor(2^256 / (target + 1)). Returned as a 256-bit big-endian byte
/// array so plain byte comparison orders chains by accumulated work.
pub fn work_from_bits(n_bits: u32) -> [u8; 32] {
    let target = expand_target(n_bits);
    if target.is_zero() {
        return [0u8; 32];
    }
    let work = (BigUint::one() << 256usize) / (target + 1u32);
    into_work_bytes(work)
}

/// Decode the compact target encoding: a 3-byte mantissa scaled by
/// 256^(exponent - 3). Degenerate encodings decode to zero.
fn expand_target(n_bits: u32) -> BigUint {
    let mantissa = n_bits & 0x00ff_ffff;
    if mantissa == 0 {
        return BigUint::zero();
    }
    let shift = 8 * (n_bits >> 24) as i64 - 24;
    let mantissa = BigUint::from(mantissa);
    if shift < 0 {
        mantissa >> (-shift) as usize
    } else {
        mantissa << shift as usize
    }
}

/// Accumulate two work values.
pub fn add_work(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    into_work_bytes(BigUint::from_bytes_be(a) + BigUint::from_bytes_be(b))
}

/// Fixed-width big-endian form, truncating anything past 256 bits.
fn into_work_bytes(value: BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    if bytes.len() >= 32 {
        out.copy_from_slice(&bytes[bytes.len() - 32..]);
    } else {
        out[32 - bytes.len()..].copy_from_slice(&bytes);
    }
    out
}

//! 18-decimal fixed-point helpers for the organic (on-chain) math path.
//!
//! Amounts and rates on the ledger are WAD-scaled integers (1.0 = 10^18).
//! Products are formed through a full 256-bit intermediate so that
//! realistic vault sizes (well past 2^64 wei) never overflow mid-multiply.

/// One whole unit in 18-decimal fixed point.
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Full-width product of two `u128`s as a `(hi, lo)` pair.
fn mul_full(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = (1u128 << 64) - 1;
    let (a_hi, a_lo) = (a >> 64, a & MASK);
    let (b_hi, b_lo) = (b >> 64, b & MASK);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let mid = (ll >> 64) + (lh & MASK) + (hl & MASK);
    let lo = (mid << 64) | (ll & MASK);
    let hi = hh + (lh >> 64) + (hl >> 64) + (mid >> 64);
    (hi, lo)
}

/// Compute `a * b / d` with a 256-bit intermediate, flooring.
///
/// Returns `None` when `d == 0` or the quotient does not fit in `u128`.
pub fn mul_div(a: u128, b: u128, d: u128) -> Option<u128> {
    if d == 0 {
        return None;
    }
    let (hi, lo) = mul_full(a, b);
    if hi == 0 {
        return Some(lo / d);
    }
    if hi >= d {
        // Quotient would need more than 128 bits.
        return None;
    }
    // Schoolbook long division of the 256-bit value (hi, lo) by d, one bit
    // at a time. Invariant: rem < d at the top of each iteration.
    let mut rem = hi;
    let mut quot: u128 = 0;
    for i in (0..128).rev() {
        let bit = (lo >> i) & 1;
        let carry = rem >> 127;
        rem = (rem << 1) | bit;
        quot <<= 1;
        if carry == 1 || rem >= d {
            rem = rem.wrapping_sub(d);
            quot |= 1;
        }
    }
    Some(quot)
}

/// WAD multiply: `a * b / WAD`, flooring.
pub fn wad_mul(a: u128, b: u128) -> Option<u128> {
    mul_div(a, b, WAD)
}

/// WAD divide: `a * WAD / b`, flooring. `None` when `b == 0`.
pub fn wad_div(a: u128, b: u128) -> Option<u128> {
    mul_div(a, WAD, b)
}

/// Lossy conversion to `f64`, for reporting and float-path hand-off only.
pub fn to_f64(x: u128) -> f64 {
    x as f64 / WAD as f64
}

/// Quantize a non-negative float of whole-token units into WAD.
///
/// Saturates at `u128::MAX`; negative and non-finite inputs map to zero.
pub fn from_f64(x: f64) -> u128 {
    if !x.is_finite() || x <= 0.0 {
        return 0;
    }
    let scaled = x * WAD as f64;
    if scaled >= u128::MAX as f64 {
        u128::MAX
    } else {
        scaled as u128
    }
}

//! Fixed-point helpers for curve arithmetic
//!
//! Every division takes an explicit [`Rounding`] so callers decide which side
//! of a trade absorbs the remainder.

use crate::error::{Error, Result};

/// 1e18 fixed-point scale
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Basis points denominator (10000 bps = 100%)
pub const BPS_DENOMINATOR: u64 = 10_000;

const LOW_MASK: u128 = u64::MAX as u128;

/// Rounding direction for integer division
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

/// Compute `a * b / d` with a 256-bit intermediate product.
///
/// Fails with `MathOverflow` when `d == 0` or the quotient does not fit in u128.
pub fn mul_div(a: u128, b: u128, d: u128, rounding: Rounding) -> Result<u128> {
    if d == 0 {
        return Err(Error::MathOverflow("mul_div by zero"));
    }

    let (hi, lo) = full_mul(a, b);

    let (quotient, remainder) = if hi == 0 {
        (lo / d, lo % d)
    } else {
        if hi >= d {
            return Err(Error::MathOverflow("mul_div"));
        }
        div_256_by_128(hi, lo, d)
    };

    match rounding {
        Rounding::Up if remainder != 0 => quotient
            .checked_add(1)
            .ok_or(Error::MathOverflow("mul_div round up")),
        _ => Ok(quotient),
    }
}

/// 128x128 -> 256 bit multiplication, returned as (high, low)
fn full_mul(a: u128, b: u128) -> (u128, u128) {
    let (a_hi, a_lo) = (a >> 64, a & LOW_MASK);
    let (b_hi, b_lo) = (b >> 64, b & LOW_MASK);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    // Each term is below 2^64 so the sum cannot overflow
    let mid = (ll >> 64) + (lh & LOW_MASK) + (hl & LOW_MASK);

    let lo = (ll & LOW_MASK) | (mid << 64);
    let hi = hh + (lh >> 64) + (hl >> 64) + (mid >> 64);

    (hi, lo)
}

/// Long division of (hi, lo) by d. Requires hi < d so the quotient fits.
fn div_256_by_128(hi: u128, lo: u128, d: u128) -> (u128, u128) {
    let mut rem = hi;
    let mut quotient: u128 = 0;

    for i in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((lo >> i) & 1);
        if carry == 1 || rem >= d {
            rem = rem.wrapping_sub(d);
            quotient |= 1u128 << i;
        }
    }

    (quotient, rem)
}

/// Integer square root with the requested rounding
pub fn sqrt(n: u128, rounding: Rounding) -> u128 {
    let floor = isqrt(n);
    match rounding {
        Rounding::Up if floor * floor != n => floor + 1,
        _ => floor,
    }
}

/// Floor square root (Newton's method)
fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }

    let bits = 128 - n.leading_zeros();
    let mut x = 1u128 << ((bits + 1) / 2);
    loop {
        let y = (x + n / x) / 2;
        if y >= x {
            return x;
        }
        x = y;
    }
}

/// Apply a basis-point rate to an amount
pub fn apply_bps(amount: u64, bps: u64, rounding: Rounding) -> Result<u64> {
    let value = mul_div(amount as u128, bps as u128, BPS_DENOMINATOR as u128, rounding)?;
    u64::try_from(value).map_err(|_| Error::MathOverflow("apply_bps"))
}

/// Narrow a u128 intermediate back to an amount
pub fn to_u64(value: u128, context: &'static str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::MathOverflow(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_div_small() {
        assert_eq!(mul_div(10, 10, 3, Rounding::Down).unwrap(), 33);
        assert_eq!(mul_div(10, 10, 3, Rounding::Up).unwrap(), 34);
        assert_eq!(mul_div(10, 10, 5, Rounding::Up).unwrap(), 20);
    }

    #[test]
    fn test_mul_div_wide_product() {
        // (2^100 * 2^100) / 2^120 = 2^80, product needs 200 bits
        let a = 1u128 << 100;
        let result = mul_div(a, a, 1u128 << 120, Rounding::Down).unwrap();
        assert_eq!(result, 1u128 << 80);

        // u128::MAX * u128::MAX / u128::MAX = u128::MAX
        let max = u128::MAX;
        assert_eq!(mul_div(max, max, max, Rounding::Down).unwrap(), max);
    }

    #[test]
    fn test_mul_div_wide_remainder() {
        // (WAD * 1e22 + ...) spans beyond u128; check against a split computation
        let a: u128 = 12_345_678_901_234_567_890_123;
        let b: u128 = 98_765_432_109_876_543_210_987;
        let d: u128 = 1_000_000_000_000_000_000_000_000;
        let down = mul_div(a, b, d, Rounding::Down).unwrap();
        let up = mul_div(a, b, d, Rounding::Up).unwrap();
        assert_eq!(up, down + 1);
        // a*b/d ~= 1.2193e21
        assert!(down > 1_219_000_000_000_000_000_000);
        assert!(down < 1_220_000_000_000_000_000_000);
    }

    #[test]
    fn test_mul_div_overflow() {
        assert!(mul_div(u128::MAX, 2, 1, Rounding::Down).is_err());
        assert!(mul_div(1, 1, 0, Rounding::Down).is_err());
    }

    #[test]
    fn test_sqrt() {
        assert_eq!(sqrt(0, Rounding::Down), 0);
        assert_eq!(sqrt(1, Rounding::Down), 1);
        assert_eq!(sqrt(15, Rounding::Down), 3);
        assert_eq!(sqrt(15, Rounding::Up), 4);
        assert_eq!(sqrt(16, Rounding::Up), 4);
        assert_eq!(sqrt(WAD * WAD, Rounding::Down), WAD);
        assert_eq!(sqrt(u128::MAX, Rounding::Down), u64::MAX as u128);
    }

    #[test]
    fn test_apply_bps() {
        assert_eq!(apply_bps(1_000_000_000, 100, Rounding::Down).unwrap(), 10_000_000);
        assert_eq!(apply_bps(999, 100, Rounding::Down).unwrap(), 9);
        assert_eq!(apply_bps(999, 100, Rounding::Up).unwrap(), 10);
    }
}

//! Bonding curve pricing
//!
//! Fixed-point math, the power-law curve, and unit conversions for display.

pub mod math;
pub mod price;

pub use math::{mul_div, Rounding, BPS_DENOMINATOR, WAD};
pub use price::{execution_price, price_impact_percent, CurveParams, PriceCurve};

/// Token decimals
pub const TOKEN_DECIMALS: u8 = 9;

/// Settlement asset decimals (gwei)
pub const SETTLEMENT_DECIMALS: u8 = 9;

/// One whole token in base units
pub const TOKEN_UNIT: u64 = 1_000_000_000;

/// One whole settlement token in base units
pub const SETTLEMENT_UNIT: u64 = 1_000_000_000;

/// Divisor turning `price * token_base_units` into settlement base units
pub const PRICE_DENOMINATOR: u128 = WAD * TOKEN_UNIT as u128;

/// Convert settlement base units to whole settlement tokens
pub fn settlement_to_human(amount: u64) -> f64 {
    amount as f64 / 10f64.powi(SETTLEMENT_DECIMALS as i32)
}

/// Convert whole settlement tokens to base units
pub fn human_to_settlement(amount: f64) -> u64 {
    (amount * 10f64.powi(SETTLEMENT_DECIMALS as i32)) as u64
}

/// Convert token base units to whole tokens
pub fn tokens_to_human(amount: u64) -> f64 {
    amount as f64 / 10f64.powi(TOKEN_DECIMALS as i32)
}

/// Convert whole tokens to base units
pub fn human_to_tokens(amount: f64) -> u64 {
    (amount * 10f64.powi(TOKEN_DECIMALS as i32)) as u64
}

/// Convert a WAD-scaled curve price to settlement tokens per whole token
pub fn price_to_human(price: u128) -> f64 {
    price as f64 / WAD as f64 / 10f64.powi(SETTLEMENT_DECIMALS as i32)
}

/// Format price for display
pub fn format_price(price: f64) -> String {
    if price < 0.000001 {
        format!("{:.12}", price)
    } else if price < 0.001 {
        format!("{:.9}", price)
    } else if price < 1.0 {
        format!("{:.6}", price)
    } else {
        format!("{:.4}", price)
    }
}

/// Minimum output accepted for an expected output and slippage tolerance
pub fn min_out_with_slippage(expected: u64, slippage_bps: u32) -> u64 {
    let slippage_factor = (BPS_DENOMINATOR).saturating_sub(slippage_bps as u64);
    ((expected as u128 * slippage_factor as u128) / BPS_DENOMINATOR as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slippage_calculation() {
        // 25% slippage (2500 bps)
        assert_eq!(min_out_with_slippage(1_000_000, 2500), 750_000);
        assert_eq!(min_out_with_slippage(1_000_000, 20_000), 0);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(settlement_to_human(1_000_000_000), 1.0);
        assert_eq!(human_to_settlement(1.5), 1_500_000_000);
        assert_eq!(tokens_to_human(2_500_000_000), 2.5);
        assert_eq!(human_to_tokens(600.0), 600 * TOKEN_UNIT);
    }

    #[test]
    fn test_price_to_human() {
        // 1e4 gwei per token = 1e-5 settlement tokens per token
        let price = 10_000 * WAD;
        assert!((price_to_human(price) - 0.00001).abs() < 1e-15);
        assert_eq!(format_price(0.00001), "0.000010000");
    }
}

//! Power-law bonding curve
//!
//! `price(s) = k * (s / S_max)^1.5`, integrated in closed form:
//! `C(s) = (2/5) * k * S_max * (s / S_max)^2.5`.
//!
//! All amounts are base units. Prices are settlement base units per whole
//! token, scaled by [`WAD`]. A price below one WAD unit reads as zero, so at
//! the default curve `spot_price` is 0 for supplies under roughly 2,200 base
//! units and only rises strictly with every base unit from a few whole tokens
//! on. Whole-token steps are strictly increasing across the curve.

use serde::{Deserialize, Serialize};

use super::math::{mul_div, sqrt, to_u64, Rounding, WAD};
use super::{PRICE_DENOMINATOR, TOKEN_UNIT};
use crate::error::{Error, Result};

/// Default price coefficient: 1e-5 settlement tokens per token at full supply
pub const DEFAULT_K_PER_TOKEN: u64 = 10_000;

/// Default maximum supply in whole tokens
pub const DEFAULT_MAX_SUPPLY_TOKENS: u64 = 1_000_000_000;

/// Curve parameters as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveParams {
    /// `k`, in settlement base units per whole token
    pub k_per_token: u64,
    /// `S_max`, in whole tokens
    pub max_supply_tokens: u64,
}

impl Default for CurveParams {
    fn default() -> Self {
        Self {
            k_per_token: DEFAULT_K_PER_TOKEN,
            max_supply_tokens: DEFAULT_MAX_SUPPLY_TOKENS,
        }
    }
}

/// Pure supply -> price / cost functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceCurve {
    k: u128,
    max_supply: u64,
    /// `k * S_max`, settlement base units
    curve_constant: u128,
}

impl PriceCurve {
    pub fn new(params: CurveParams) -> Result<Self> {
        if params.k_per_token == 0 {
            return Err(Error::Config("curve k must be positive".to_string()));
        }
        if params.max_supply_tokens == 0 {
            return Err(Error::Config("curve max supply must be positive".to_string()));
        }

        let max_supply = params
            .max_supply_tokens
            .checked_mul(TOKEN_UNIT)
            .ok_or_else(|| Error::Config("curve max supply overflows u64 base units".to_string()))?;

        Ok(Self {
            k: params.k_per_token as u128,
            max_supply,
            curve_constant: params.k_per_token as u128 * params.max_supply_tokens as u128,
        })
    }

    /// Maximum mintable supply in token base units
    pub fn max_supply(&self) -> u64 {
        self.max_supply
    }

    /// Tokens still available on the curve
    pub fn remaining(&self, supply: u64) -> u64 {
        self.max_supply.saturating_sub(supply)
    }

    /// Spot price at `supply`, floored once to a WAD unit
    pub fn spot_price(&self, supply: u64) -> Result<u128> {
        self.check_supply(supply)?;
        let r = self.ratio(supply, Rounding::Down)?;
        let kr = self.k.checked_mul(r).ok_or(Error::MathOverflow("spot_price"))?;
        let scaled = r.checked_mul(WAD).ok_or(Error::MathOverflow("spot_price"))?;
        mul_div(kr, sqrt(scaled, Rounding::Down), WAD, Rounding::Down)
    }

    /// Settlement required to mint `delta` tokens starting at `supply_from`.
    ///
    /// Rounds up: the buyer pays any remainder.
    pub fn cost_to_buy(&self, supply_from: u64, delta: u64) -> Result<u64> {
        let supply_to = supply_from
            .checked_add(delta)
            .filter(|s| *s <= self.max_supply)
            .ok_or(Error::SupplyExhausted {
                requested: delta,
                remaining: self.remaining(supply_from),
            })?;

        let span = self.integral_wad(supply_to)?.saturating_sub(self.integral_wad(supply_from)?);
        to_u64(mul_div(span, 1, WAD, Rounding::Up)?, "cost_to_buy")
    }

    /// Settlement released by burning `delta` tokens back into the curve from `supply_from`.
    ///
    /// Rounds down: the seller absorbs any remainder.
    pub fn return_from_sell(&self, supply_from: u64, delta: u64) -> Result<u64> {
        self.check_supply(supply_from)?;
        let supply_to = supply_from.checked_sub(delta).ok_or_else(|| {
            Error::InvalidAmount(format!(
                "cannot sell {} tokens against circulating supply {}",
                delta, supply_from
            ))
        })?;

        let span = self.integral_wad(supply_from)?.saturating_sub(self.integral_wad(supply_to)?);
        to_u64(mul_div(span, 1, WAD, Rounding::Down)?, "return_from_sell")
    }

    /// Largest token delta whose `cost_to_buy` does not exceed `amount`.
    ///
    /// Capped at the remaining curve supply.
    pub fn invert_cost(&self, supply_from: u64, amount: u64) -> Result<u64> {
        self.check_supply(supply_from)?;

        let mut hi = self.remaining(supply_from);
        if hi == 0 || self.cost_to_buy(supply_from, hi)? <= amount {
            return Ok(hi);
        }

        let mut lo = 0u64;
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.cost_to_buy(supply_from, mid)? <= amount {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        Ok(lo)
    }

    /// Market capitalisation `spot_price(supply) * supply` in settlement base units
    pub fn market_cap(&self, supply: u64) -> Result<u128> {
        let price = self.spot_price(supply)?;
        mul_div(price, supply as u128, PRICE_DENOMINATOR, Rounding::Down)
    }

    /// Supply as a fraction of max supply, in bps
    pub fn supply_fraction_bps(&self, supply: u64) -> u64 {
        ((supply as u128 * 10_000) / self.max_supply as u128) as u64
    }

    /// `C(s)` in settlement base units, scaled by WAD.
    ///
    /// Buy cost and sell return share the same difference of two
    /// endpoints and only round when leaving the WAD scale.
    fn integral_wad(&self, supply: u64) -> Result<u128> {
        let r = self.ratio(supply, Rounding::Down)?;
        let r25 = pow_2_5(r, Rounding::Down)?;
        mul_div(self.curve_constant, 2 * r25, 5, Rounding::Down)
    }

    /// `supply / S_max` in WAD
    fn ratio(&self, supply: u64, rounding: Rounding) -> Result<u128> {
        mul_div(supply as u128, WAD, self.max_supply as u128, rounding)
    }

    fn check_supply(&self, supply: u64) -> Result<()> {
        if supply > self.max_supply {
            return Err(Error::SupplyExhausted {
                requested: supply,
                remaining: 0,
            });
        }
        Ok(())
    }
}

/// `r^1.5` for `r` in WAD
fn pow_1_5(r: u128, rounding: Rounding) -> Result<u128> {
    let scaled = r.checked_mul(WAD).ok_or(Error::MathOverflow("pow_1_5"))?;
    mul_div(r, sqrt(scaled, rounding), WAD, rounding)
}

/// `r^2.5` for `r` in WAD
fn pow_2_5(r: u128, rounding: Rounding) -> Result<u128> {
    mul_div(pow_1_5(r, rounding)?, r, WAD, rounding)
}

/// Average execution price of a fill, WAD-scaled settlement base units per whole token
pub fn execution_price(settlement: u64, tokens: u64) -> Result<u128> {
    if tokens == 0 {
        return Ok(0);
    }
    mul_div(settlement as u128, PRICE_DENOMINATOR, tokens as u128, Rounding::Down)
}

/// Price impact of a fill relative to the spot price before it, in percent
pub fn price_impact_percent(spot_price: u128, execution_price: u128) -> f64 {
    if spot_price == 0 {
        return 0.0;
    }
    ((execution_price as f64 - spot_price as f64) / spot_price as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{SETTLEMENT_UNIT, TOKEN_UNIT};

    fn default_curve() -> PriceCurve {
        PriceCurve::new(CurveParams::default()).unwrap()
    }

    #[test]
    fn test_spot_price_endpoints() {
        let curve = default_curve();
        assert_eq!(curve.spot_price(0).unwrap(), 0);
        // At full supply price = k = 1e4 gwei per token
        assert_eq!(curve.spot_price(curve.max_supply()).unwrap(), 10_000 * WAD);
    }

    #[test]
    fn test_price_strictly_increasing() {
        let curve = default_curve();
        let points = [0u64, 1, 10, 1_000, 1_000_000, 36_000_000, 500_000_000, 999_999_998];

        for tokens in points {
            let supply = tokens * TOKEN_UNIT;
            let here = curve.spot_price(supply).unwrap();
            let next = curve.spot_price(supply + TOKEN_UNIT).unwrap();
            assert!(next > here, "price not increasing at {} tokens", tokens);
        }
    }

    #[test]
    fn test_spot_price_base_unit_resolution() {
        let curve = default_curve();
        assert_eq!(curve.spot_price(1).unwrap(), 0);
        assert_eq!(curve.spot_price(1_000).unwrap(), 0);
        // r = 1e-12, r^1.5 = 1e-18, price = k * 1e-18 in WAD units
        assert_eq!(curve.spot_price(1_000_000).unwrap(), 10_000);

        let mut previous = 0;
        for supply in 0..20_000u64 {
            let price = curve.spot_price(supply).unwrap();
            assert!(price >= previous, "price fell at {} base units", supply);
            previous = price;
        }
        assert!(previous > 0);

        let start = 50 * TOKEN_UNIT;
        let mut previous = curve.spot_price(start).unwrap();
        for supply in start + 1..start + 2_000 {
            let price = curve.spot_price(supply).unwrap();
            assert!(price > previous, "price flat at {} base units", supply);
            previous = price;
        }
    }

    #[test]
    fn test_full_curve_cost() {
        let curve = default_curve();
        // (2/5) * k * S_max = 0.4 * 1e4 * 1e9 gwei = 4000 ETH
        let cost = curve.cost_to_buy(0, curve.max_supply()).unwrap();
        assert_eq!(cost, 4_000 * SETTLEMENT_UNIT);
    }

    #[test]
    fn test_round_trip_favors_protocol() {
        let curve = default_curve();
        let cases = [
            (0u64, 36_000_000 * TOKEN_UNIT),
            (36_000_000 * TOKEN_UNIT, 5_000_000 * TOKEN_UNIT),
            (400_000_000 * TOKEN_UNIT, 123_456_789),
            (10 * TOKEN_UNIT, 1),
        ];

        for (from, delta) in cases {
            let cost = curve.cost_to_buy(from, delta).unwrap();
            let ret = curve.return_from_sell(from + delta, delta).unwrap();
            assert!(ret <= cost, "sell returned more than buy cost");
            assert!(cost - ret <= 1, "round trip lost {} units", cost - ret);
        }
    }

    #[test]
    fn test_round_trip_single_unit_rounding() {
        let curve = default_curve();
        let mut from = 0u64;
        let mut delta = 7_919u64;
        for _ in 0..500 {
            let cost = curve.cost_to_buy(from, delta).unwrap();
            let ret = curve.return_from_sell(from + delta, delta).unwrap();
            assert!(ret <= cost && cost - ret <= 1, "from {} delta {}", from, delta);
            from = from.wrapping_add(delta.wrapping_mul(104_729)) % (curve.max_supply() / 2);
            delta = delta.wrapping_mul(31).wrapping_add(17) % (50_000_000 * TOKEN_UNIT) + 1;
        }
    }

    #[test]
    fn test_invert_cost_matches_closed_form() {
        let curve = default_curve();
        let amount = 980_000_000u64; // 0.98 ETH

        let tokens = curve.invert_cost(0, amount).unwrap();
        assert!(curve.cost_to_buy(0, tokens).unwrap() <= amount);
        assert!(curve.cost_to_buy(0, tokens + 1).unwrap() > amount);

        // s = S_max * (5 * amount / (2 * k * S_max))^(2/5)
        let m = 1e4 * 1e9;
        let expected = 1e18 * (5.0 * amount as f64 / (2.0 * m)).powf(0.4);
        let relative = (tokens as f64 - expected).abs() / expected;
        assert!(relative < 1e-6, "relative error {}", relative);
    }

    #[test]
    fn test_invert_cost_caps_at_remaining() {
        let curve = default_curve();
        let from = curve.max_supply() - 5 * TOKEN_UNIT;
        let tokens = curve.invert_cost(from, u64::MAX).unwrap();
        assert_eq!(tokens, 5 * TOKEN_UNIT);
        assert_eq!(curve.invert_cost(curve.max_supply(), 1_000).unwrap(), 0);
    }

    #[test]
    fn test_sell_beyond_supply_rejected() {
        let curve = default_curve();
        assert!(curve.return_from_sell(10, 11).is_err());
        assert!(matches!(
            curve.cost_to_buy(curve.max_supply(), 1),
            Err(Error::SupplyExhausted { .. })
        ));
    }

    #[test]
    fn test_market_cap() {
        let curve = default_curve();
        // At full supply: k * S_max = 1e13 gwei
        let cap = curve.market_cap(curve.max_supply()).unwrap();
        assert_eq!(cap, 10_000 * SETTLEMENT_UNIT as u128);
        assert_eq!(curve.supply_fraction_bps(curve.max_supply() / 2), 5_000);
    }

    #[test]
    fn test_execution_price() {
        // 1 settlement token per whole token
        let price = execution_price(5 * TOKEN_UNIT, 5 * TOKEN_UNIT).unwrap();
        assert_eq!(price, PRICE_DENOMINATOR);
        assert_eq!(execution_price(100, 0).unwrap(), 0);

        assert_eq!(price_impact_percent(100, 150), 50.0);
        assert_eq!(price_impact_percent(0, 150), 0.0);
    }

    #[test]
    fn test_invalid_params() {
        assert!(PriceCurve::new(CurveParams { k_per_token: 0, max_supply_tokens: 1 }).is_err());
        assert!(PriceCurve::new(CurveParams { k_per_token: 1, max_supply_tokens: u64::MAX }).is_err());
    }
}

//! Fee policies and composition
//!
//! Every enabled policy of the requested [`FeeType`] is evaluated against the
//! same notional (parallel, not compounding) in the fixed recipient order
//! platform -> creator -> burn -> auto-liquidity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::curve::math::{apply_bps, Rounding, BPS_DENOMINATOR};
use crate::error::{Error, Result};

/// What a fee is charged on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    Creation,
    Trade,
    Graduation,
    Liquidity,
    MultiSig,
}

/// Who receives a fee share. Declaration order is composition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRecipient {
    Platform,
    Creator,
    Burn,
    AutoLiquidity,
}

impl fmt::Display for FeeRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeRecipient::Platform => write!(f, "platform"),
            FeeRecipient::Creator => write!(f, "creator"),
            FeeRecipient::Burn => write!(f, "burn"),
            FeeRecipient::AutoLiquidity => write!(f, "auto_liquidity"),
        }
    }
}

/// A single configured fee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub fee_type: FeeType,
    pub recipient: FeeRecipient,
    /// bps when `is_percentage`, otherwise a flat amount in settlement base units
    pub amount: u64,
    #[serde(default)]
    pub min_amount: u64,
    #[serde(default = "default_max_amount")]
    pub max_amount: u64,
    pub is_percentage: bool,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_max_amount() -> u64 {
    u64::MAX
}

fn default_enabled() -> bool {
    true
}

impl FeePolicy {
    /// Percentage policy with no clamp
    pub fn percentage(fee_type: FeeType, recipient: FeeRecipient, bps: u64) -> Self {
        Self {
            fee_type,
            recipient,
            amount: bps,
            min_amount: 0,
            max_amount: u64::MAX,
            is_percentage: true,
            is_enabled: true,
        }
    }

    /// Flat-amount policy
    pub fn flat(fee_type: FeeType, recipient: FeeRecipient, amount: u64) -> Self {
        Self {
            fee_type,
            recipient,
            amount,
            min_amount: 0,
            max_amount: u64::MAX,
            is_percentage: false,
            is_enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_percentage && self.amount > BPS_DENOMINATOR {
            return Err(Error::FeeConfig(format!(
                "{} fee of {} bps exceeds 100%",
                self.recipient, self.amount
            )));
        }
        if self.min_amount > self.max_amount {
            return Err(Error::FeeConfig(format!(
                "{} fee min {} above max {}",
                self.recipient, self.min_amount, self.max_amount
            )));
        }
        Ok(())
    }

    /// Fee charged on `notional`, clamped to `[min_amount, max_amount]`.
    ///
    /// Percentages floor, so a notional too small to carry a fee pays none.
    fn charge(&self, notional: u64) -> Result<u64> {
        let raw = if self.is_percentage {
            apply_bps(notional, self.amount, Rounding::Down)?
        } else {
            self.amount
        };
        Ok(raw.clamp(self.min_amount, self.max_amount))
    }
}

/// One line of a fee breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeCharge {
    pub fee_type: FeeType,
    pub recipient: FeeRecipient,
    pub amount: u64,
}

/// Result of composing fees on a notional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub notional: u64,
    pub net_amount: u64,
    pub charges: Vec<FeeCharge>,
}

impl FeeBreakdown {
    pub fn total(&self) -> u64 {
        self.charges.iter().map(|c| c.amount).sum()
    }

    /// Sum of charges going to `recipient`
    pub fn share(&self, recipient: FeeRecipient) -> u64 {
        self.charges
            .iter()
            .filter(|c| c.recipient == recipient)
            .map(|c| c.amount)
            .sum()
    }
}

/// Stateless fee composition
pub struct FeeComposer;

impl FeeComposer {
    /// Compose all enabled `fee_type` policies on `notional`
    pub fn compose(notional: u64, policies: &[FeePolicy], fee_type: FeeType) -> Result<FeeBreakdown> {
        let mut applicable: Vec<&FeePolicy> = policies
            .iter()
            .filter(|p| p.is_enabled && p.fee_type == fee_type)
            .collect();
        // Stable: equal recipients keep configuration order
        applicable.sort_by_key(|p| p.recipient);

        let mut charges = Vec::with_capacity(applicable.len());
        let mut total: u64 = 0;

        for policy in applicable {
            policy.validate()?;
            let amount = policy.charge(notional)?;
            total = total
                .checked_add(amount)
                .ok_or(Error::MathOverflow("fee total"))?;
            charges.push(FeeCharge {
                fee_type,
                recipient: policy.recipient,
                amount,
            });
        }

        if total > notional {
            return Err(Error::FeeConfig(format!(
                "fees {} exceed notional {}",
                total, notional
            )));
        }

        Ok(FeeBreakdown {
            notional,
            net_amount: notional - total,
            charges,
        })
    }
}

/// Platform and creator revenue accrued by one entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeAccruals {
    pub platform: u64,
    pub creator: u64,
}

impl FeeAccruals {
    /// Accrue the platform and creator shares of a set of charges
    pub fn accrue(&mut self, charges: &[FeeCharge]) -> Result<()> {
        for charge in charges {
            let slot = match charge.recipient {
                FeeRecipient::Platform => &mut self.platform,
                FeeRecipient::Creator => &mut self.creator,
                FeeRecipient::Burn | FeeRecipient::AutoLiquidity => continue,
            };
            *slot = slot
                .checked_add(charge.amount)
                .ok_or(Error::MathOverflow("fee accrual"))?;
        }
        Ok(())
    }
}

/// Buy-and-burn share configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnConfig {
    pub entity_id: String,
    pub burn_rate_bps: u64,
    /// Tokens burned so far, only increases
    pub total_burned: u64,
    pub enabled: bool,
}

impl BurnConfig {
    pub fn new(entity_id: impl Into<String>, burn_rate_bps: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            burn_rate_bps,
            total_burned: 0,
            enabled: burn_rate_bps > 0,
        }
    }

    pub fn as_policy(&self) -> Option<FeePolicy> {
        self.enabled
            .then(|| FeePolicy::percentage(FeeType::Trade, FeeRecipient::Burn, self.burn_rate_bps))
    }
}

/// Auto-liquidity share configuration and accumulators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoLiquidityConfig {
    pub entity_id: String,
    pub liquidity_rate_bps: u64,
    /// Tokens bought for the pool, consumed at graduation
    pub collected_tokens: u64,
    /// Settlement held for the pool, consumed at graduation
    pub collected_settlement: u64,
    pub enabled: bool,
}

impl AutoLiquidityConfig {
    pub fn new(entity_id: impl Into<String>, liquidity_rate_bps: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            liquidity_rate_bps,
            collected_tokens: 0,
            collected_settlement: 0,
            enabled: liquidity_rate_bps > 0,
        }
    }

    pub fn as_policy(&self) -> Option<FeePolicy> {
        self.enabled.then(|| {
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::AutoLiquidity, self.liquidity_rate_bps)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_policies() -> Vec<FeePolicy> {
        vec![
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::Creator, 100),
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::Platform, 100),
            FeePolicy::flat(FeeType::Creation, FeeRecipient::Platform, 5_000),
        ]
    }

    #[test]
    fn test_compose_order_and_net() {
        let breakdown = FeeComposer::compose(1_000_000_000, &trade_policies(), FeeType::Trade).unwrap();

        assert_eq!(breakdown.net_amount, 980_000_000);
        assert_eq!(breakdown.charges.len(), 2);
        assert_eq!(breakdown.charges[0].recipient, FeeRecipient::Platform);
        assert_eq!(breakdown.charges[1].recipient, FeeRecipient::Creator);
    }

    #[test]
    fn test_fee_conservation() {
        let mut policies = trade_policies();
        policies.push(FeePolicy::percentage(FeeType::Trade, FeeRecipient::Burn, 37));
        policies.push(FeePolicy::percentage(FeeType::Trade, FeeRecipient::AutoLiquidity, 13));

        for notional in [0u64, 999, 10_001, 123_456_789, 10_000_000_000_000] {
            let breakdown = FeeComposer::compose(notional, &policies, FeeType::Trade).unwrap();
            assert_eq!(breakdown.net_amount + breakdown.total(), notional);
        }
    }

    #[test]
    fn test_disabled_and_clamped() {
        let mut platform = FeePolicy::percentage(FeeType::Trade, FeeRecipient::Platform, 100);
        platform.min_amount = 50;
        platform.max_amount = 1_000;
        let mut creator = FeePolicy::percentage(FeeType::Trade, FeeRecipient::Creator, 100);
        creator.is_enabled = false;

        let policies = vec![platform, creator];

        let small = FeeComposer::compose(100, &policies, FeeType::Trade).unwrap();
        assert_eq!(small.charges.len(), 1);
        assert_eq!(small.total(), 50);

        let large = FeeComposer::compose(10_000_000, &policies, FeeType::Trade).unwrap();
        assert_eq!(large.total(), 1_000);
    }

    #[test]
    fn test_percentage_floors_on_dust() {
        let dust = FeeComposer::compose(1, &trade_policies(), FeeType::Trade).unwrap();
        assert_eq!(dust.total(), 0);
        assert_eq!(dust.net_amount, 1);

        // 1% of 199 is 1.99
        let small = FeeComposer::compose(199, &trade_policies(), FeeType::Trade).unwrap();
        assert_eq!(small.total(), 2);
        assert_eq!(small.net_amount, 197);
    }

    #[test]
    fn test_fees_exceed_notional() {
        let policies = vec![FeePolicy::flat(FeeType::Trade, FeeRecipient::Platform, 500)];
        let result = FeeComposer::compose(100, &policies, FeeType::Trade);
        assert!(matches!(result, Err(Error::FeeConfig(_))));
    }

    #[test]
    fn test_invalid_policy() {
        let policies = vec![FeePolicy::percentage(FeeType::Trade, FeeRecipient::Platform, 10_001)];
        assert!(FeeComposer::compose(100, &policies, FeeType::Trade).is_err());
    }

    #[test]
    fn test_accruals() {
        let breakdown = FeeComposer::compose(1_000_000_000, &trade_policies(), FeeType::Trade).unwrap();
        let mut accruals = FeeAccruals::default();
        accruals.accrue(&breakdown.charges).unwrap();
        assert_eq!(accruals.platform, 10_000_000);
        assert_eq!(accruals.creator, 10_000_000);
    }

    #[test]
    fn test_protocol_share_policies() {
        assert!(BurnConfig::new("tok", 0).as_policy().is_none());
        let policy = AutoLiquidityConfig::new("tok", 50).as_policy().unwrap();
        assert_eq!(policy.recipient, FeeRecipient::AutoLiquidity);
        assert_eq!(policy.amount, 50);
    }
}

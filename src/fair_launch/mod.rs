//! Fair-launch admission control
//!
//! Per-wallet caps, per-transaction caps, cooldowns, the anti-snipe window
//! and the blacklist. The controller only decides; the engine updates the
//! participant counters after a successful trade.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block time used to turn anti-snipe blocks into seconds
pub const DEFAULT_BLOCK_TIME_SECS: u64 = 12;

/// Cliff plus linear unlock of fair-launch purchases, measured from launch time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingSchedule {
    /// Nothing unlocks before the cliff
    pub cliff_seconds: u64,
    /// Everything is unlocked once this much time has passed
    pub duration_seconds: u64,
}

impl VestingSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.duration_seconds == 0 || self.cliff_seconds > self.duration_seconds {
            return Err(Error::InvalidAmount(format!(
                "vesting cliff {}s must not exceed duration {}s",
                self.cliff_seconds, self.duration_seconds
            )));
        }
        Ok(())
    }

    /// Portion of `total` still locked at `now`
    pub fn locked_amount(&self, total: u64, start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - start).num_seconds().max(0) as u64;
        if elapsed < self.cliff_seconds {
            return total;
        }
        if elapsed >= self.duration_seconds {
            return 0;
        }
        let unlocked = (total as u128 * elapsed as u128 / self.duration_seconds as u128) as u64;
        total - unlocked
    }
}

/// Creator-owned fair-launch rules. Immutable once trading is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairLaunchConfig {
    pub entity_id: String,
    /// Token base units
    pub max_buy_per_wallet: u64,
    /// Token base units
    pub max_buy_per_tx: u64,
    pub cooldown_period_seconds: u64,
    pub anti_snipe_blocks: u64,
    #[serde(default)]
    pub vesting_schedule: Option<VestingSchedule>,
    pub enabled: bool,
    pub trading_enabled: bool,
    pub launch_time: DateTime<Utc>,
}

impl FairLaunchConfig {
    /// Config with admission switched off
    pub fn disabled(entity_id: impl Into<String>, launch_time: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            max_buy_per_wallet: u64::MAX,
            max_buy_per_tx: u64::MAX,
            cooldown_period_seconds: 0,
            anti_snipe_blocks: 0,
            vesting_schedule: None,
            enabled: false,
            trading_enabled: true,
            launch_time,
        }
    }

    /// Apply an update while trading is not yet enabled
    pub fn apply(&mut self, update: &FairLaunchUpdate) -> Result<()> {
        if self.trading_enabled {
            return Err(Error::ConfigLocked(self.entity_id.clone()));
        }
        if let Some(schedule) = &update.vesting_schedule {
            schedule.validate()?;
        }

        if let Some(v) = update.max_buy_per_wallet {
            self.max_buy_per_wallet = v;
        }
        if let Some(v) = update.max_buy_per_tx {
            self.max_buy_per_tx = v;
        }
        if let Some(v) = update.cooldown_period_seconds {
            self.cooldown_period_seconds = v;
        }
        if let Some(v) = update.anti_snipe_blocks {
            self.anti_snipe_blocks = v;
        }
        if let Some(v) = update.vesting_schedule {
            self.vesting_schedule = Some(v);
        }
        if let Some(v) = update.enabled {
            self.enabled = v;
        }
        if let Some(v) = update.launch_time {
            self.launch_time = v;
        }
        Ok(())
    }
}

/// Partial update of a [`FairLaunchConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairLaunchUpdate {
    pub max_buy_per_wallet: Option<u64>,
    pub max_buy_per_tx: Option<u64>,
    pub cooldown_period_seconds: Option<u64>,
    pub anti_snipe_blocks: Option<u64>,
    pub vesting_schedule: Option<VestingSchedule>,
    pub enabled: Option<bool>,
    pub launch_time: Option<DateTime<Utc>>,
}

/// Per-buyer counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairLaunchParticipant {
    pub fair_launch_id: String,
    pub buyer: String,
    pub total_bought: u64,
    pub total_spent: u64,
    #[serde(default)]
    pub last_buy_time: Option<DateTime<Utc>>,
    pub buy_count: u32,
    pub is_blacklisted: bool,
}

impl FairLaunchParticipant {
    pub fn new(fair_launch_id: impl Into<String>, buyer: impl Into<String>) -> Self {
        Self {
            fair_launch_id: fair_launch_id.into(),
            buyer: buyer.into(),
            total_bought: 0,
            total_spent: 0,
            last_buy_time: None,
            buy_count: 0,
            is_blacklisted: false,
        }
    }

    /// Record a successful buy
    pub fn record_buy(&mut self, tokens: u64, spent: u64, now: DateTime<Utc>) -> Result<()> {
        self.total_bought = self
            .total_bought
            .checked_add(tokens)
            .ok_or(Error::MathOverflow("participant total_bought"))?;
        self.total_spent = self
            .total_spent
            .checked_add(spent)
            .ok_or(Error::MathOverflow("participant total_spent"))?;
        self.last_buy_time = Some(now);
        self.buy_count = self.buy_count.saturating_add(1);
        Ok(())
    }
}

/// Why a buy was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    TradingNotEnabled,
    Blacklisted,
    ExceedsPerTxCap,
    ExceedsPerWalletCap,
    CooldownActive,
    AntiSnipeWindowActive,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::TradingNotEnabled => write!(f, "trading not enabled"),
            DenialReason::Blacklisted => write!(f, "blacklisted"),
            DenialReason::ExceedsPerTxCap => write!(f, "exceeds per-tx cap"),
            DenialReason::ExceedsPerWalletCap => write!(f, "exceeds per-wallet cap"),
            DenialReason::CooldownActive => write!(f, "cooldown active"),
            DenialReason::AntiSnipeWindowActive => write!(f, "anti-snipe window active"),
        }
    }
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    Denied(DenialReason),
}

impl AdmissionDecision {
    pub fn into_result(self) -> Result<()> {
        match self {
            AdmissionDecision::Allowed => Ok(()),
            AdmissionDecision::Denied(reason) => Err(Error::AdmissionDenied(reason.to_string())),
        }
    }
}

/// Stateless admission rules. First failing rule wins.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    block_time_secs: u64,
}

impl AdmissionController {
    pub fn new(block_time_secs: u64) -> Self {
        Self { block_time_secs }
    }

    /// Rules that hold regardless of the buy size: trading open and buyer not blacklisted.
    pub fn check_buyer(
        &self,
        config: &FairLaunchConfig,
        participant: Option<&FairLaunchParticipant>,
    ) -> AdmissionDecision {
        if !config.enabled {
            return AdmissionDecision::Allowed;
        }
        if !config.trading_enabled {
            return AdmissionDecision::Denied(DenialReason::TradingNotEnabled);
        }
        if participant.map(|p| p.is_blacklisted).unwrap_or(false) {
            return AdmissionDecision::Denied(DenialReason::Blacklisted);
        }
        AdmissionDecision::Allowed
    }

    /// Decide whether `requested` tokens may be bought.
    ///
    /// `participant` is `None` for a buyer with no recorded activity.
    pub fn check(
        &self,
        config: &FairLaunchConfig,
        participant: Option<&FairLaunchParticipant>,
        requested: u64,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        use AdmissionDecision::{Allowed, Denied};

        if !config.enabled {
            return Allowed;
        }
        if let Denied(reason) = self.check_buyer(config, participant) {
            return Denied(reason);
        }
        if requested > config.max_buy_per_tx {
            return Denied(DenialReason::ExceedsPerTxCap);
        }

        let total_bought = participant.map(|p| p.total_bought).unwrap_or(0);
        if total_bought.saturating_add(requested) > config.max_buy_per_wallet {
            return Denied(DenialReason::ExceedsPerWalletCap);
        }

        let last_buy = participant
            .filter(|p| p.buy_count > 0)
            .and_then(|p| p.last_buy_time);
        if let Some(last) = last_buy {
            if within(now, last, config.cooldown_period_seconds) {
                return Denied(DenialReason::CooldownActive);
            }
        }

        let window = config.anti_snipe_blocks.saturating_mul(self.block_time_secs);
        if within(now, config.launch_time, window) {
            return Denied(DenialReason::AntiSnipeWindowActive);
        }

        Allowed
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_TIME_SECS)
    }
}

/// `now` falls before `start + secs`; an unrepresentable end never elapses
fn within(now: DateTime<Utc>, start: DateTime<Utc>, secs: u64) -> bool {
    let secs = secs.min(i64::MAX as u64 / 1_000) as i64;
    match start.checked_add_signed(Duration::seconds(secs)) {
        Some(end) => now < end,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::TOKEN_UNIT;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> FairLaunchConfig {
        FairLaunchConfig {
            entity_id: "tok".into(),
            max_buy_per_wallet: 1_000 * TOKEN_UNIT,
            max_buy_per_tx: 500 * TOKEN_UNIT,
            cooldown_period_seconds: 300,
            anti_snipe_blocks: 0,
            vesting_schedule: None,
            enabled: true,
            trading_enabled: true,
            launch_time: t(0),
        }
    }

    #[test]
    fn test_disabled_allows_everything() {
        let mut cfg = config();
        cfg.enabled = false;
        cfg.trading_enabled = false;
        let decision = AdmissionController::default().check(&cfg, None, u64::MAX, t(0));
        assert_eq!(decision, AdmissionDecision::Allowed);
    }

    #[test]
    fn test_per_tx_cap() {
        let decision = AdmissionController::default().check(&config(), None, 600 * TOKEN_UNIT, t(10));
        assert_eq!(decision, AdmissionDecision::Denied(DenialReason::ExceedsPerTxCap));
        assert_eq!(
            decision.into_result().unwrap_err().to_string(),
            "Admission denied: exceeds per-tx cap"
        );
    }

    #[test]
    fn test_rule_order() {
        let controller = AdmissionController::default();
        let mut cfg = config();
        cfg.trading_enabled = false;

        let mut participant = FairLaunchParticipant::new("tok", "0xabc");
        participant.is_blacklisted = true;

        // Trading gate fires before the blacklist
        assert_eq!(
            controller.check(&cfg, Some(&participant), 1, t(10)),
            AdmissionDecision::Denied(DenialReason::TradingNotEnabled)
        );

        cfg.trading_enabled = true;
        // Blacklist fires before caps
        assert_eq!(
            controller.check(&cfg, Some(&participant), u64::MAX, t(10)),
            AdmissionDecision::Denied(DenialReason::Blacklisted)
        );
    }

    #[test]
    fn test_check_buyer_ignores_size_rules() {
        let controller = AdmissionController::default();
        let mut cfg = config();
        cfg.anti_snipe_blocks = 1_000;

        let mut participant = FairLaunchParticipant::new("tok", "0xabc");
        assert_eq!(controller.check_buyer(&cfg, Some(&participant)), AdmissionDecision::Allowed);

        participant.is_blacklisted = true;
        assert_eq!(
            controller.check_buyer(&cfg, Some(&participant)),
            AdmissionDecision::Denied(DenialReason::Blacklisted)
        );

        cfg.enabled = false;
        assert_eq!(controller.check_buyer(&cfg, Some(&participant)), AdmissionDecision::Allowed);
    }

    #[test]
    fn test_per_wallet_cap() {
        let mut participant = FairLaunchParticipant::new("tok", "0xabc");
        participant.record_buy(700 * TOKEN_UNIT, 1, t(0)).unwrap();

        let decision = AdmissionController::default().check(
            &config(),
            Some(&participant),
            400 * TOKEN_UNIT,
            t(1_000),
        );
        assert_eq!(decision, AdmissionDecision::Denied(DenialReason::ExceedsPerWalletCap));
    }

    #[test]
    fn test_cooldown() {
        let controller = AdmissionController::default();
        let mut participant = FairLaunchParticipant::new("tok", "0xabc");
        participant.record_buy(100 * TOKEN_UNIT, 1, t(0)).unwrap();

        assert_eq!(
            controller.check(&config(), Some(&participant), TOKEN_UNIT, t(100)),
            AdmissionDecision::Denied(DenialReason::CooldownActive)
        );
        assert_eq!(
            controller.check(&config(), Some(&participant), TOKEN_UNIT, t(301)),
            AdmissionDecision::Allowed
        );
    }

    #[test]
    fn test_anti_snipe_window() {
        let controller = AdmissionController::new(12);
        let mut cfg = config();
        cfg.anti_snipe_blocks = 5;

        assert_eq!(
            controller.check(&cfg, None, TOKEN_UNIT, t(59)),
            AdmissionDecision::Denied(DenialReason::AntiSnipeWindowActive)
        );
        assert_eq!(controller.check(&cfg, None, TOKEN_UNIT, t(60)), AdmissionDecision::Allowed);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let controller = AdmissionController::default();
        let cfg = config();
        let mut participant = FairLaunchParticipant::new("tok", "0xabc");
        participant.record_buy(100 * TOKEN_UNIT, 1, t(0)).unwrap();
        let before = participant.clone();

        let first = controller.check(&cfg, Some(&participant), 50 * TOKEN_UNIT, t(150));
        let second = controller.check(&cfg, Some(&participant), 50 * TOKEN_UNIT, t(150));
        assert_eq!(first, second);
        assert_eq!(participant, before);
    }

    #[test]
    fn test_config_locked_after_trading_enabled() {
        let mut cfg = config();
        let update = FairLaunchUpdate {
            max_buy_per_tx: Some(1),
            ..Default::default()
        };
        assert!(matches!(cfg.apply(&update), Err(Error::ConfigLocked(_))));

        cfg.trading_enabled = false;
        cfg.apply(&update).unwrap();
        assert_eq!(cfg.max_buy_per_tx, 1);
    }

    #[test]
    fn test_vesting_schedule() {
        let schedule = VestingSchedule {
            cliff_seconds: 100,
            duration_seconds: 1_000,
        };
        assert_eq!(schedule.locked_amount(1_000, t(0), t(50)), 1_000);
        assert_eq!(schedule.locked_amount(1_000, t(0), t(500)), 500);
        assert_eq!(schedule.locked_amount(1_000, t(0), t(1_000)), 0);

        let invalid = VestingSchedule {
            cliff_seconds: 10,
            duration_seconds: 5,
        };
        assert!(invalid.validate().is_err());
    }
}

//! Bonding curve trade execution
//!
//! Buys mint along the curve and sells burn back into it. Each trade is
//! planned against a versioned snapshot and committed as a single mutation
//! covering the curve, the holder, the participant, fee accruals and the
//! trade record.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EngineEvent, EventSink, TradeExecuted};
use super::graduation::{GraduationMonitor, GraduationProgress};
use super::types::{
    CurveState, CurveStatus, EntityId, GraduationRecord, Holder, TokenProfile, TradeKind, TradeRecord,
};
use super::{commit_with_retry, Plan};
use crate::config::{Config, FairLaunchDefaults, FeeConfig};
use crate::curve::math::{mul_div, Rounding};
use crate::curve::{execution_price, price_impact_percent, PriceCurve, TOKEN_UNIT};
use crate::error::{Error, Result};
use crate::fair_launch::{AdmissionController, FairLaunchConfig, FairLaunchParticipant, FairLaunchUpdate};
use crate::fees::{
    AutoLiquidityConfig, BurnConfig, FeeAccruals, FeeBreakdown, FeeComposer, FeeRecipient, FeeType,
};
use crate::ledger::{EntityRecord, LedgerMutation, LedgerStore};

/// Parameters of a new entity
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub entity_id: EntityId,
    pub name: String,
    pub symbol: String,
    pub creator: String,
    pub token_address: String,
    /// Settlement paid by the creator; Creation fees are taken from it
    pub creation_payment: u64,
    /// Overrides of the configured fair-launch defaults
    pub fair_launch: Option<FairLaunchUpdate>,
}

#[derive(Debug, Clone)]
pub struct BuyRequest {
    pub entity_id: EntityId,
    pub trader: String,
    /// Gross settlement paid, base units
    pub settlement_amount: u64,
    pub min_tokens_out: u64,
    /// Caller-supplied idempotency reference, usually a transaction hash
    pub tx_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SellRequest {
    pub entity_id: EntityId,
    pub trader: String,
    pub token_amount: u64,
    /// Floor on settlement received after fees
    pub min_settlement_out: u64,
    pub tx_ref: Option<String>,
}

/// Side-effect free preview of a buy
#[derive(Debug, Clone, Serialize)]
pub struct BuyQuote {
    pub settlement_in: u64,
    pub fees: FeeBreakdown,
    pub tokens_out: u64,
    pub execution_price: u128,
    pub spot_price_before: u128,
    pub spot_price_after: u128,
    pub price_impact_pct: f64,
}

/// Side-effect free preview of a sell
#[derive(Debug, Clone, Serialize)]
pub struct SellQuote {
    pub tokens_in: u64,
    /// Settlement released by the curve before fees
    pub gross_settlement: u64,
    pub fees: FeeBreakdown,
    pub settlement_out: u64,
    pub execution_price: u128,
    pub spot_price_before: u128,
    pub spot_price_after: u128,
    pub price_impact_pct: f64,
}

/// Result of a committed trade
#[derive(Debug, Clone)]
pub struct TradeReceipt {
    pub trade: TradeRecord,
    /// Curve state right after the trade
    pub curve: CurveState,
    /// Graduation attempt started by this trade, if any
    pub graduation: Option<GraduationRecord>,
}

/// Operator view of one entity
#[derive(Debug, Clone, Serialize)]
pub struct CurveReport {
    pub version: u64,
    pub profile: TokenProfile,
    pub curve: CurveState,
    pub fair_launch: FairLaunchConfig,
    pub accruals: FeeAccruals,
    pub total_burned: u64,
    pub collected_tokens: u64,
    pub collected_settlement: u64,
    pub reference_usd_price: f64,
    pub progress: GraduationProgress,
    pub latest_graduation: Option<GraduationRecord>,
}

/// Where the burn and auto-liquidity shares of a trade end up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ProtocolRouting {
    /// Settlement spent buying tokens that are burned immediately
    burn_settlement: u64,
    burned_tokens: u64,
    /// Half of the auto-liquidity share, swapped into tokens
    liquidity_swapped: u64,
    liquidity_tokens: u64,
    /// Other half, held as settlement for the pool
    liquidity_held: u64,
}

struct BuyFill {
    fees: FeeBreakdown,
    tokens_out: u64,
    routing: ProtocolRouting,
    spot_before: u128,
    spot_after: u128,
}

struct SellFill {
    gross: u64,
    fees: FeeBreakdown,
    routing: ProtocolRouting,
    spot_before: u128,
    spot_after: u128,
}

/// Committed trade awaiting post-commit work
struct Executed {
    trade: TradeRecord,
    curve: CurveState,
    token_address: String,
}

/// Trade orchestration over a [`LedgerStore`]
pub struct BondingCurveEngine {
    store: Arc<dyn LedgerStore>,
    curve: PriceCurve,
    admission: AdmissionController,
    graduation: GraduationMonitor,
    events: EventSink,
    admins: HashSet<String>,
    fees: FeeConfig,
    fair_launch: FairLaunchDefaults,
    max_commit_retries: u32,
}

impl BondingCurveEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: &Config, events: EventSink) -> Result<Self> {
        let curve = PriceCurve::new(config.curve.params())?;
        let graduation = GraduationMonitor::new(
            store.clone(),
            curve,
            config.graduation.clone(),
            events.clone(),
            config.engine.max_commit_retries,
        )?;

        Ok(Self {
            store,
            curve,
            admission: AdmissionController::new(config.fair_launch.block_time_secs),
            graduation,
            events,
            admins: config.engine.admins.iter().map(|a| a.to_lowercase()).collect(),
            fees: config.fees.clone(),
            fair_launch: config.fair_launch.clone(),
            max_commit_retries: config.engine.max_commit_retries,
        })
    }

    pub fn curve(&self) -> &PriceCurve {
        &self.curve
    }

    pub fn graduation(&self) -> &GraduationMonitor {
        &self.graduation
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn is_admin(&self, address: &str) -> bool {
        self.admins.contains(&address.to_lowercase())
    }

    /// Register a new entity with an empty curve
    pub async fn launch(&self, request: LaunchRequest, now: DateTime<Utc>) -> Result<EntityRecord> {
        if request.entity_id.trim().is_empty() || request.entity_id.contains(':') {
            return Err(Error::InvalidAmount(format!(
                "invalid entity id '{}'",
                request.entity_id
            )));
        }
        if request.symbol.trim().is_empty() {
            return Err(Error::InvalidAmount("token symbol is required".to_string()));
        }

        let fee_policies = self.fees.policies();
        let creation = FeeComposer::compose(request.creation_payment, &fee_policies, FeeType::Creation)?;
        let mut accruals = FeeAccruals::default();
        accruals.accrue(&creation.charges)?;

        let fair_launch = self.initial_fair_launch(&request, now)?;
        let entity_id = request.entity_id.clone();

        let entity = EntityRecord {
            profile: TokenProfile {
                name: request.name,
                symbol: request.symbol,
                creator: request.creator,
                token_address: request.token_address,
            },
            curve: CurveState::new(entity_id.clone(), now),
            fair_launch,
            fee_policies,
            burn: BurnConfig::new(entity_id.clone(), self.fees.burn_rate_bps),
            auto_liquidity: AutoLiquidityConfig::new(entity_id.clone(), self.fees.auto_liquidity_bps),
            accruals,
            graduations: Vec::new(),
        };

        self.store.create(entity.clone()).await?;

        info!(
            entity = %entity_id,
            symbol = %entity.profile.symbol,
            creator = %entity.profile.creator,
            creation_fee = creation.total(),
            fair_launch = entity.fair_launch.enabled,
            "Entity launched"
        );
        Ok(entity)
    }

    fn initial_fair_launch(&self, request: &LaunchRequest, now: DateTime<Utc>) -> Result<FairLaunchConfig> {
        let defaults = &self.fair_launch;
        let mut config = if defaults.enabled {
            FairLaunchConfig {
                entity_id: request.entity_id.clone(),
                max_buy_per_wallet: defaults.max_buy_per_wallet_tokens.saturating_mul(TOKEN_UNIT),
                max_buy_per_tx: defaults.max_buy_per_tx_tokens.saturating_mul(TOKEN_UNIT),
                cooldown_period_seconds: defaults.cooldown_period_seconds,
                anti_snipe_blocks: defaults.anti_snipe_blocks,
                vesting_schedule: None,
                enabled: true,
                trading_enabled: false,
                launch_time: now,
            }
        } else {
            FairLaunchConfig::disabled(request.entity_id.clone(), now)
        };

        if let Some(update) = &request.fair_launch {
            config.trading_enabled = false;
            config.apply(update)?;
        }
        // With admission off there is nothing for the creator to open
        config.trading_enabled = !config.enabled;
        Ok(config)
    }

    /// Preview a buy of `settlement_amount`
    pub async fn quote_buy(&self, entity_id: &str, settlement_amount: u64) -> Result<BuyQuote> {
        let snapshot = self.store.load(entity_id).await?;
        let fill = self.fill_buy(&snapshot.entity, settlement_amount)?;
        let execution_price = execution_price(settlement_amount, fill.tokens_out)?;

        Ok(BuyQuote {
            settlement_in: settlement_amount,
            tokens_out: fill.tokens_out,
            execution_price,
            spot_price_before: fill.spot_before,
            spot_price_after: fill.spot_after,
            price_impact_pct: price_impact_percent(fill.spot_before, execution_price),
            fees: fill.fees,
        })
    }

    /// Preview a sell of `token_amount`
    pub async fn quote_sell(&self, entity_id: &str, token_amount: u64) -> Result<SellQuote> {
        let snapshot = self.store.load(entity_id).await?;
        let fill = self.fill_sell(&snapshot.entity, token_amount)?;
        let execution_price = execution_price(fill.fees.net_amount, token_amount)?;

        Ok(SellQuote {
            tokens_in: token_amount,
            gross_settlement: fill.gross,
            settlement_out: fill.fees.net_amount,
            execution_price,
            spot_price_before: fill.spot_before,
            spot_price_after: fill.spot_after,
            price_impact_pct: price_impact_percent(fill.spot_before, execution_price),
            fees: fill.fees,
        })
    }

    /// Buy tokens with settlement
    pub async fn execute_buy(&self, request: BuyRequest, now: DateTime<Utc>) -> Result<TradeReceipt> {
        let request = &request;
        let result = commit_with_retry(
            self.store.as_ref(),
            &request.entity_id,
            self.max_commit_retries,
            move || self.plan_buy(request, now),
        )
        .await;

        let executed = result.map_err(|e| {
            if e.is_rejection() {
                info!(entity = %request.entity_id, trader = %request.trader, "Buy rejected: {}", e);
            }
            e
        })?;

        info!(
            entity = %request.entity_id,
            trader = %request.trader,
            settlement_in = executed.trade.amount_in,
            tokens_out = executed.trade.amount_out,
            supply = executed.curve.circulating_supply,
            reserve = executed.curve.reserve_balance,
            "Buy executed"
        );
        Ok(self.after_trade(executed, request.min_tokens_out, now).await)
    }

    /// Sell tokens back into the curve
    pub async fn execute_sell(&self, request: SellRequest, now: DateTime<Utc>) -> Result<TradeReceipt> {
        let request = &request;
        let result = commit_with_retry(
            self.store.as_ref(),
            &request.entity_id,
            self.max_commit_retries,
            move || self.plan_sell(request, now),
        )
        .await;

        let executed = result.map_err(|e| {
            if e.is_rejection() {
                info!(entity = %request.entity_id, trader = %request.trader, "Sell rejected: {}", e);
            }
            e
        })?;

        info!(
            entity = %request.entity_id,
            trader = %request.trader,
            tokens_in = executed.trade.amount_in,
            settlement_out = executed.trade.amount_out,
            supply = executed.curve.circulating_supply,
            reserve = executed.curve.reserve_balance,
            "Sell executed"
        );
        Ok(self.after_trade(executed, request.min_settlement_out, now).await)
    }

    /// Publish the trade and run the graduation check. The trade is already
    /// committed, so a failing check is only logged.
    async fn after_trade(&self, executed: Executed, min_out: u64, now: DateTime<Utc>) -> TradeReceipt {
        let Executed {
            trade,
            curve,
            token_address,
        } = executed;

        let idempotency_key = trade
            .tx_ref
            .clone()
            .unwrap_or_else(|| format!("{}:trade:{}", trade.entity_id, trade.id));
        self.events.publish(EngineEvent::TradeExecuted(TradeExecuted {
            entity_id: trade.entity_id.clone(),
            token_address,
            kind: trade.kind,
            trader: trade.trader.clone(),
            amount_in: trade.amount_in,
            amount_out: trade.amount_out,
            min_out,
            idempotency_key,
        }));

        let graduation = match self.graduation.check(&trade.entity_id, now).await {
            Ok(record) => record,
            Err(e) => {
                warn!(entity = %trade.entity_id, "Graduation check failed: {}", e);
                None
            }
        };

        TradeReceipt {
            trade,
            curve,
            graduation,
        }
    }

    async fn plan_buy(&self, request: &BuyRequest, now: DateTime<Utc>) -> Result<Plan<Executed>> {
        let entity_id = request.entity_id.as_str();
        let snapshot = self.store.load(entity_id).await?;
        let entity = &snapshot.entity;

        ensure_tradeable(entity)?;
        self.ensure_new_ref(entity_id, request.tx_ref.as_deref()).await?;

        let participant = self.store.participant(entity_id, &request.trader).await?;
        let admin = self.is_admin(&request.trader);
        if !admin {
            self.admission
                .check_buyer(&entity.fair_launch, participant.as_ref())
                .into_result()?;
        }

        let fill = self.fill_buy(entity, request.settlement_amount)?;

        if !admin {
            self.admission
                .check(&entity.fair_launch, participant.as_ref(), fill.tokens_out, now)
                .into_result()?;
        }

        if fill.tokens_out < request.min_tokens_out {
            return Err(Error::SlippageExceeded {
                expected: request.min_tokens_out,
                actual: fill.tokens_out,
            });
        }

        let mut curve = entity.curve.clone();
        let mut burn = entity.burn.clone();
        let mut auto_liquidity = entity.auto_liquidity.clone();

        curve.reserve_balance = add(curve.reserve_balance, fill.fees.net_amount, "reserve")?;
        curve.circulating_supply = add(curve.circulating_supply, fill.tokens_out, "supply")?;
        apply_routing(&mut curve, &mut burn, &mut auto_liquidity, &fill.routing)?;
        curve.spot_price = fill.spot_after;
        curve.total_volume = add(curve.total_volume, request.settlement_amount, "volume")?;
        curve.total_transactions = curve.total_transactions.saturating_add(1);

        let price = execution_price(request.settlement_amount, fill.tokens_out)?;

        let mut holder = self
            .store
            .holder(entity_id, &request.trader)
            .await?
            .unwrap_or_else(|| Holder::new(entity_id, request.trader.clone()));
        if holder.balance == 0 {
            curve.holder_count = curve.holder_count.saturating_add(1);
        }
        holder.average_buy_price =
            weighted_price(holder.average_buy_price, holder.total_bought, price, fill.tokens_out)?;
        holder.balance = add(holder.balance, fill.tokens_out, "holder balance")?;
        holder.total_bought = add(holder.total_bought, fill.tokens_out, "holder total_bought")?;

        let mut participant =
            participant.unwrap_or_else(|| FairLaunchParticipant::new(entity_id, request.trader.clone()));
        participant.record_buy(fill.tokens_out, request.settlement_amount, now)?;

        let mut accruals = entity.accruals.clone();
        accruals.accrue(&fill.fees.charges)?;

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            kind: TradeKind::Buy,
            trader: request.trader.clone(),
            amount_in: request.settlement_amount,
            amount_out: fill.tokens_out,
            price,
            fees_applied: fill.fees.charges,
            timestamp: now,
            tx_ref: request.tx_ref.clone(),
        };

        Ok(Plan {
            version: snapshot.version,
            mutation: Some(LedgerMutation {
                curve: Some(curve.clone()),
                burn: Some(burn),
                auto_liquidity: Some(auto_liquidity),
                accruals: Some(accruals),
                holders: vec![holder],
                participants: vec![participant],
                trade: Some(trade.clone()),
                ..Default::default()
            }),
            output: Executed {
                trade,
                curve,
                token_address: entity.profile.token_address.clone(),
            },
        })
    }

    async fn plan_sell(&self, request: &SellRequest, now: DateTime<Utc>) -> Result<Plan<Executed>> {
        let entity_id = request.entity_id.as_str();
        let snapshot = self.store.load(entity_id).await?;
        let entity = &snapshot.entity;

        ensure_tradeable(entity)?;
        self.ensure_new_ref(entity_id, request.tx_ref.as_deref()).await?;

        let mut holder = self
            .store
            .holder(entity_id, &request.trader)
            .await?
            .unwrap_or_else(|| Holder::new(entity_id, request.trader.clone()));
        if holder.balance < request.token_amount {
            return Err(Error::InsufficientBalance {
                available: holder.balance,
                required: request.token_amount,
            });
        }

        if !self.is_admin(&request.trader) {
            self.check_vesting(entity, &holder, request.token_amount, now).await?;
        }

        let fill = self.fill_sell(entity, request.token_amount)?;
        let settlement_out = fill.fees.net_amount;
        if settlement_out < request.min_settlement_out {
            return Err(Error::SlippageExceeded {
                expected: request.min_settlement_out,
                actual: settlement_out,
            });
        }

        let mut curve = entity.curve.clone();
        let mut burn = entity.burn.clone();
        let mut auto_liquidity = entity.auto_liquidity.clone();

        curve.circulating_supply -= request.token_amount;
        curve.reserve_balance = curve
            .reserve_balance
            .checked_sub(fill.gross)
            .ok_or_else(|| Error::Internal(format!("reserve of {} cannot cover sell", entity_id)))?;
        apply_routing(&mut curve, &mut burn, &mut auto_liquidity, &fill.routing)?;
        curve.spot_price = fill.spot_after;
        curve.total_volume = add(curve.total_volume, fill.gross, "volume")?;
        curve.total_transactions = curve.total_transactions.saturating_add(1);

        holder.balance -= request.token_amount;
        holder.total_sold = add(holder.total_sold, request.token_amount, "holder total_sold")?;
        if holder.balance == 0 {
            curve.holder_count = curve.holder_count.saturating_sub(1);
        }

        let mut accruals = entity.accruals.clone();
        accruals.accrue(&fill.fees.charges)?;

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            kind: TradeKind::Sell,
            trader: request.trader.clone(),
            amount_in: request.token_amount,
            amount_out: settlement_out,
            price: execution_price(settlement_out, request.token_amount)?,
            fees_applied: fill.fees.charges,
            timestamp: now,
            tx_ref: request.tx_ref.clone(),
        };

        Ok(Plan {
            version: snapshot.version,
            mutation: Some(LedgerMutation {
                curve: Some(curve.clone()),
                burn: Some(burn),
                auto_liquidity: Some(auto_liquidity),
                accruals: Some(accruals),
                holders: vec![holder],
                trade: Some(trade.clone()),
                ..Default::default()
            }),
            output: Executed {
                trade,
                curve,
                token_address: entity.profile.token_address.clone(),
            },
        })
    }

    async fn ensure_new_ref(&self, entity_id: &str, tx_ref: Option<&str>) -> Result<()> {
        if let Some(tx_ref) = tx_ref {
            if self.store.has_trade_ref(entity_id, tx_ref).await? {
                return Err(Error::DuplicateTrade(tx_ref.to_string()));
            }
        }
        Ok(())
    }

    /// Fair-launch purchases unlock along the vesting schedule
    async fn check_vesting(
        &self,
        entity: &EntityRecord,
        holder: &Holder,
        requested: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let fair_launch = &entity.fair_launch;
        let Some(schedule) = fair_launch.vesting_schedule.filter(|_| fair_launch.enabled) else {
            return Ok(());
        };
        let Some(participant) = self.store.participant(entity.entity_id(), &holder.address).await? else {
            return Ok(());
        };

        let locked = schedule
            .locked_amount(participant.total_bought, fair_launch.launch_time, now)
            .min(holder.balance);
        let unlocked = holder.balance - locked;
        if requested > unlocked {
            return Err(Error::VestingLocked {
                locked,
                requested,
                unlocked,
            });
        }
        Ok(())
    }

    fn fill_buy(&self, entity: &EntityRecord, settlement_amount: u64) -> Result<BuyFill> {
        if settlement_amount == 0 {
            return Err(Error::InvalidAmount("buy amount must be positive".to_string()));
        }

        let supply = entity.curve.circulating_supply;
        let remaining = self.curve.remaining(supply);
        if remaining == 0 {
            return Err(Error::SupplyExhausted {
                requested: 0,
                remaining,
            });
        }

        let fees = FeeComposer::compose(settlement_amount, &entity.policies(), FeeType::Trade)?;
        let tokens_out = self.curve.invert_cost(supply, fees.net_amount)?;
        if tokens_out == remaining {
            let full_cost = self.curve.cost_to_buy(supply, remaining)?;
            if fees.net_amount > full_cost {
                debug!(
                    entity = %entity.entity_id(),
                    net = fees.net_amount,
                    full_cost,
                    "Buy overshoots the remaining curve"
                );
                return Err(Error::SupplyExhausted {
                    requested: remaining.saturating_add(1),
                    remaining,
                });
            }
        }
        if tokens_out == 0 {
            return Err(Error::InvalidAmount(format!(
                "{} settlement buys no tokens",
                settlement_amount
            )));
        }

        let after = supply + tokens_out;
        let routing = self.route_protocol_shares(&fees, after)?;
        Ok(BuyFill {
            spot_before: self.curve.spot_price(supply)?,
            spot_after: self.curve.spot_price(after + routing.liquidity_tokens)?,
            fees,
            tokens_out,
            routing,
        })
    }

    fn fill_sell(&self, entity: &EntityRecord, token_amount: u64) -> Result<SellFill> {
        if token_amount == 0 {
            return Err(Error::InvalidAmount("sell amount must be positive".to_string()));
        }

        let supply = entity.curve.circulating_supply;
        let gross = self.curve.return_from_sell(supply, token_amount)?;
        let fees = FeeComposer::compose(gross, &entity.policies(), FeeType::Trade)?;

        let after = supply - token_amount;
        let routing = self.route_protocol_shares(&fees, after)?;
        Ok(SellFill {
            gross,
            spot_before: self.curve.spot_price(supply)?,
            spot_after: self.curve.spot_price(after + routing.liquidity_tokens)?,
            fees,
            routing,
        })
    }

    /// The burn share buys on the curve and burns what it bought; half of the
    /// auto-liquidity share buys tokens for the pool and half is held.
    fn route_protocol_shares(&self, fees: &FeeBreakdown, supply: u64) -> Result<ProtocolRouting> {
        let burn_settlement = fees.share(FeeRecipient::Burn);
        let liquidity = fees.share(FeeRecipient::AutoLiquidity);
        let liquidity_swapped = liquidity / 2;

        let buy = |amount: u64| -> Result<u64> {
            if amount == 0 {
                Ok(0)
            } else {
                self.curve.invert_cost(supply, amount)
            }
        };

        Ok(ProtocolRouting {
            burn_settlement,
            burned_tokens: buy(burn_settlement)?,
            liquidity_swapped,
            liquidity_tokens: buy(liquidity_swapped)?,
            liquidity_held: liquidity - liquidity_swapped,
        })
    }

    /// Pause an active or graduating curve
    pub async fn pause(&self, entity_id: &str) -> Result<CurveState> {
        let curve = self
            .update(entity_id, |entity| {
                let mut curve = entity.curve.clone();
                if !curve.status.can_pause() {
                    return Err(Error::InvalidTransition {
                        entity: entity_id.to_string(),
                        from: curve.status,
                        to: CurveStatus::Paused,
                    });
                }
                curve.paused_from = Some(curve.status);
                curve.status = CurveStatus::Paused;
                Ok(curve_only(curve))
            })
            .await?;

        info!(entity = %entity_id, paused_from = ?curve.paused_from, "Curve paused");
        Ok(curve)
    }

    /// Resume a paused curve into the state it was paused from
    pub async fn resume(&self, entity_id: &str, now: DateTime<Utc>) -> Result<CurveState> {
        let curve = self
            .update(entity_id, |entity| {
                let mut curve = entity.curve.clone();
                if curve.status != CurveStatus::Paused {
                    return Err(Error::InvalidTransition {
                        entity: entity_id.to_string(),
                        from: curve.status,
                        to: curve.paused_from.unwrap_or(CurveStatus::Active),
                    });
                }
                curve.status = curve.paused_from.take().unwrap_or(CurveStatus::Active);
                Ok(curve_only(curve))
            })
            .await?;

        info!(entity = %entity_id, status = %curve.status, "Curve resumed");

        // Trades may have been priced in while paused
        if curve.status == CurveStatus::Active {
            if let Err(e) = self.graduation.check(entity_id, now).await {
                warn!(entity = %entity_id, "Graduation check failed: {}", e);
            }
        }
        Ok(curve)
    }

    /// Change fair-launch rules before trading opens
    pub async fn update_fair_launch(
        &self,
        entity_id: &str,
        update: &FairLaunchUpdate,
    ) -> Result<FairLaunchConfig> {
        let config = self
            .update(entity_id, |entity| {
                let mut fair_launch = entity.fair_launch.clone();
                fair_launch.apply(update)?;
                let mutation = LedgerMutation {
                    fair_launch: Some(fair_launch.clone()),
                    ..Default::default()
                };
                Ok((Some(mutation), fair_launch))
            })
            .await?;

        info!(entity = %entity_id, enabled = config.enabled, "Fair launch updated");
        Ok(config)
    }

    /// Open trading; the fair-launch config is frozen from here on
    pub async fn enable_trading(&self, entity_id: &str) -> Result<FairLaunchConfig> {
        let config = self
            .update(entity_id, |entity| {
                let mut fair_launch = entity.fair_launch.clone();
                if fair_launch.trading_enabled {
                    return Ok((None, fair_launch));
                }
                fair_launch.trading_enabled = true;
                let mutation = LedgerMutation {
                    fair_launch: Some(fair_launch.clone()),
                    ..Default::default()
                };
                Ok((Some(mutation), fair_launch))
            })
            .await?;

        info!(entity = %entity_id, "Trading enabled");
        Ok(config)
    }

    /// Add or remove `address` from the blacklist
    pub async fn set_blacklisted(
        &self,
        entity_id: &str,
        address: &str,
        blacklisted: bool,
    ) -> Result<FairLaunchParticipant> {
        let participant = commit_with_retry(
            self.store.as_ref(),
            entity_id,
            self.max_commit_retries,
            move || self.plan_blacklist(entity_id, address, blacklisted),
        )
        .await?;

        info!(entity = %entity_id, address = %address, blacklisted, "Blacklist updated");
        Ok(participant)
    }

    async fn plan_blacklist(
        &self,
        entity_id: &str,
        address: &str,
        blacklisted: bool,
    ) -> Result<Plan<FairLaunchParticipant>> {
        let snapshot = self.store.load(entity_id).await?;
        let mut participant = self
            .store
            .participant(entity_id, address)
            .await?
            .unwrap_or_else(|| FairLaunchParticipant::new(entity_id, address));

        let mutation = (participant.is_blacklisted != blacklisted).then(|| {
            participant.is_blacklisted = blacklisted;
            LedgerMutation {
                participants: vec![participant.clone()],
                ..Default::default()
            }
        });

        Ok(Plan {
            version: snapshot.version,
            mutation,
            output: participant,
        })
    }

    /// Commit a change computed from the entity record alone
    async fn update<T, F>(&self, entity_id: &str, change: F) -> Result<T>
    where
        F: Fn(&EntityRecord) -> Result<(Option<LedgerMutation>, T)>,
    {
        let change = &change;
        commit_with_retry(
            self.store.as_ref(),
            entity_id,
            self.max_commit_retries,
            move || self.plan_update(entity_id, change),
        )
        .await
    }

    async fn plan_update<T, F>(&self, entity_id: &str, change: &F) -> Result<Plan<T>>
    where
        F: Fn(&EntityRecord) -> Result<(Option<LedgerMutation>, T)>,
    {
        let snapshot = self.store.load(entity_id).await?;
        let (mutation, output) = change(&snapshot.entity)?;
        Ok(Plan {
            version: snapshot.version,
            mutation,
            output,
        })
    }

    /// Curve, fees and graduation progress of one entity
    pub async fn status(&self, entity_id: &str) -> Result<CurveReport> {
        let snapshot = self.store.load(entity_id).await?;
        let progress = self.graduation.progress(snapshot.entity.curve.circulating_supply)?;
        let entity = snapshot.entity;

        Ok(CurveReport {
            version: snapshot.version,
            latest_graduation: entity.latest_graduation().cloned(),
            total_burned: entity.burn.total_burned,
            collected_tokens: entity.auto_liquidity.collected_tokens,
            collected_settlement: entity.auto_liquidity.collected_settlement,
            reference_usd_price: self.graduation.reference_price(),
            progress,
            profile: entity.profile,
            curve: entity.curve,
            fair_launch: entity.fair_launch,
            accruals: entity.accruals,
        })
    }

    /// Holders with a positive balance, largest first
    pub async fn holders(&self, entity_id: &str) -> Result<Vec<Holder>> {
        let mut holders: Vec<Holder> = self
            .store
            .holders(entity_id)
            .await?
            .into_iter()
            .filter(|h| h.balance > 0)
            .collect();
        holders.sort_by(|a, b| b.balance.cmp(&a.balance).then_with(|| a.address.cmp(&b.address)));
        Ok(holders)
    }

    /// Most recent trades first
    pub async fn trades(&self, entity_id: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        let trades = self.store.trades(entity_id, limit).await?;
        debug!(entity = %entity_id, count = trades.len(), "Loaded trades");
        Ok(trades)
    }
}

fn ensure_tradeable(entity: &EntityRecord) -> Result<()> {
    let status = entity.curve.status;
    if !status.is_tradeable() {
        return Err(Error::CurveNotActive {
            entity: entity.entity_id().to_string(),
            status,
        });
    }
    Ok(())
}

fn curve_only(curve: CurveState) -> (Option<LedgerMutation>, CurveState) {
    let mutation = LedgerMutation {
        curve: Some(curve.clone()),
        ..Default::default()
    };
    (Some(mutation), curve)
}

fn apply_routing(
    curve: &mut CurveState,
    burn: &mut BurnConfig,
    auto_liquidity: &mut AutoLiquidityConfig,
    routing: &ProtocolRouting,
) -> Result<()> {
    // Burned tokens are minted and destroyed in one step: supply is unchanged
    curve.reserve_balance = add(curve.reserve_balance, routing.burn_settlement, "reserve")?;
    burn.total_burned = add(burn.total_burned, routing.burned_tokens, "total_burned")?;

    curve.reserve_balance = add(curve.reserve_balance, routing.liquidity_swapped, "reserve")?;
    curve.circulating_supply = add(curve.circulating_supply, routing.liquidity_tokens, "supply")?;
    auto_liquidity.collected_tokens =
        add(auto_liquidity.collected_tokens, routing.liquidity_tokens, "collected_tokens")?;
    auto_liquidity.collected_settlement =
        add(auto_liquidity.collected_settlement, routing.liquidity_held, "collected_settlement")?;
    Ok(())
}

/// Volume-weighted average of two fills
fn weighted_price(average: u128, weight: u64, price: u128, amount: u64) -> Result<u128> {
    let total = weight as u128 + amount as u128;
    if total == 0 {
        return Ok(0);
    }
    let existing = mul_div(average, weight as u128, total, Rounding::Down)?;
    let incoming = mul_div(price, amount as u128, total, Rounding::Down)?;
    existing
        .checked_add(incoming)
        .ok_or(Error::MathOverflow("average buy price"))
}

fn add(a: u64, b: u64, what: &'static str) -> Result<u64> {
    a.checked_add(b).ok_or(Error::MathOverflow(what))
}

//! Graduation state machine
//!
//! Once market cap crosses the threshold an active curve flips to
//! Graduating and a Pending [`GraduationRecord`] is created in the same
//! commit. The hand-off to the chain has no timeout: a record stays
//! Pending/Processing until a confirmation arrives or an operator re-drives it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::events::{EngineEvent, EventSink};
use super::types::{CurveStatus, GraduationRecord, GraduationStatus};
use super::{commit_with_retry, Plan};
use crate::config::GraduationConfig;
use crate::curve::math::{apply_bps, mul_div, Rounding};
use crate::curve::{PriceCurve, PRICE_DENOMINATOR, SETTLEMENT_UNIT};
use crate::error::{Error, Result};
use crate::fees::{FeeComposer, FeeRecipient, FeeType};
use crate::ledger::{EntityRecord, LedgerMutation, LedgerStore};

const USD_MICROS: u128 = 1_000_000;

/// Outcome reported by the Chain Execution Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Failed,
}

/// Confirmation of a submitted request, keyed by its idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfirmation {
    pub idempotency_key: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub status: ConfirmationStatus,
    /// Pool created by a successful graduation
    #[serde(default)]
    pub pool_address: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Market cap progress toward graduation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GraduationProgress {
    pub market_cap_usd: f64,
    pub threshold_usd: u64,
    /// Market cap relative to the threshold, bps (authoritative)
    pub market_cap_bps: u64,
    /// Supply relative to the display target, bps (display only)
    pub supply_fraction_bps: u64,
}

/// Watches market cap and drives graduation attempts
pub struct GraduationMonitor {
    store: Arc<dyn LedgerStore>,
    curve: PriceCurve,
    config: GraduationConfig,
    /// USD per whole settlement token, in micro-dollars
    reference_usd_micros: AtomicU64,
    events: EventSink,
    max_commit_retries: u32,
}

impl GraduationMonitor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        curve: PriceCurve,
        config: GraduationConfig,
        events: EventSink,
        max_commit_retries: u32,
    ) -> Result<Self> {
        let reference = usd_to_micros(config.reference_usd_price)?;
        Ok(Self {
            store,
            curve,
            config,
            reference_usd_micros: AtomicU64::new(reference),
            events,
            max_commit_retries,
        })
    }

    /// Current reference price, USD per settlement token
    pub fn reference_price(&self) -> f64 {
        self.reference_usd_micros.load(Ordering::Relaxed) as f64 / USD_MICROS as f64
    }

    /// Replace the reference price used for market cap in USD
    pub fn set_reference_price(&self, usd: f64) -> Result<()> {
        let micros = usd_to_micros(usd)?;
        let previous = self.reference_usd_micros.swap(micros, Ordering::Relaxed);
        info!(
            previous_usd = previous as f64 / USD_MICROS as f64,
            usd, "Reference price updated"
        );
        Ok(())
    }

    /// Market cap at `supply`, in micro-dollars
    pub fn market_cap_usd_micros(&self, supply: u64) -> Result<u128> {
        let cap = self.curve.market_cap(supply)?;
        let rate = self.reference_usd_micros.load(Ordering::Relaxed) as u128;
        mul_div(cap, rate, SETTLEMENT_UNIT as u128, Rounding::Down)
    }

    pub fn threshold_reached(&self, supply: u64) -> Result<bool> {
        let threshold = self.config.threshold_usd as u128 * USD_MICROS;
        Ok(self.market_cap_usd_micros(supply)? >= threshold)
    }

    pub fn progress(&self, supply: u64) -> Result<GraduationProgress> {
        let cap = self.market_cap_usd_micros(supply)?;
        let threshold = self.config.threshold_usd as u128 * USD_MICROS;
        let market_cap_bps = mul_div(cap, 10_000, threshold.max(1), Rounding::Down)?;

        let target = self.config.display_supply_fraction_bps.max(1);
        let supply_fraction_bps = self.curve.supply_fraction_bps(supply) * 10_000 / target;

        Ok(GraduationProgress {
            market_cap_usd: cap as f64 / USD_MICROS as f64,
            threshold_usd: self.config.threshold_usd,
            market_cap_bps: u64::try_from(market_cap_bps).unwrap_or(u64::MAX),
            supply_fraction_bps,
        })
    }

    /// Start graduation if the threshold is reached.
    ///
    /// Returns the new record, or `None` when the curve is not active, below
    /// the threshold, or already has an attempt in flight.
    pub async fn check(&self, entity_id: &str, now: DateTime<Utc>) -> Result<Option<GraduationRecord>> {
        let created = commit_with_retry(
            self.store.as_ref(),
            entity_id,
            self.max_commit_retries,
            move || self.plan_check(entity_id, now),
        )
        .await?;

        Ok(created.map(|(record, token_address)| {
            info!(
                entity = %entity_id,
                attempt = record.attempt,
                eth_liquidity = record.eth_liquidity,
                token_liquidity = record.token_liquidity,
                "Graduation threshold reached, requesting liquidity"
            );
            self.events.publish(EngineEvent::GraduationRequested {
                token_address,
                record: record.clone(),
            });
            record
        }))
    }

    async fn plan_check(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan<Option<(GraduationRecord, String)>>> {
        let snapshot = self.store.load(entity_id).await?;
        let entity = &snapshot.entity;

        let eligible = entity.curve.status == CurveStatus::Active
            && entity.open_graduation().is_none()
            && self.threshold_reached(entity.curve.circulating_supply)?;
        if !eligible {
            return Ok(Plan {
                version: snapshot.version,
                mutation: None,
                output: None,
            });
        }

        let attempt = entity.latest_graduation().map(|g| g.attempt).unwrap_or(0) + 1;
        let record = self.plan_record(entity, attempt, now)?;

        let mut curve = entity.curve.clone();
        curve.status = CurveStatus::Graduating;

        Ok(Plan {
            version: snapshot.version,
            mutation: Some(LedgerMutation {
                curve: Some(curve),
                graduation: Some(record.clone()),
                ..Default::default()
            }),
            output: Some((record, entity.profile.token_address.clone())),
        })
    }

    /// The executor accepted the request
    pub async fn mark_processing(
        &self,
        entity_id: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<GraduationRecord> {
        commit_with_retry(
            self.store.as_ref(),
            entity_id,
            self.max_commit_retries,
            move || self.plan_processing(entity_id, attempt, now),
        )
        .await
    }

    async fn plan_processing(
        &self,
        entity_id: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Plan<GraduationRecord>> {
        let snapshot = self.store.load(entity_id).await?;
        let mut record = find_attempt(&snapshot.entity, attempt)?;

        match record.status {
            GraduationStatus::Processing => Ok(Plan {
                version: snapshot.version,
                mutation: None,
                output: record,
            }),
            GraduationStatus::Pending => {
                record.status = GraduationStatus::Processing;
                record.updated_at = now;
                Ok(Plan {
                    version: snapshot.version,
                    mutation: Some(LedgerMutation {
                        graduation: Some(record.clone()),
                        ..Default::default()
                    }),
                    output: record,
                })
            }
            GraduationStatus::Completed | GraduationStatus::Failed => {
                Err(Error::GraduationNotPending(entity_id.to_string()))
            }
        }
    }

    /// Apply a chain confirmation for a graduation attempt
    pub async fn confirm(
        &self,
        confirmation: &ChainConfirmation,
        now: DateTime<Utc>,
    ) -> Result<GraduationRecord> {
        let (entity_id, attempt) = GraduationRecord::parse_idempotency_key(&confirmation.idempotency_key)
            .ok_or_else(|| Error::GraduationNotPending(confirmation.idempotency_key.clone()))?;
        let entity_id = entity_id.as_str();

        let record = commit_with_retry(
            self.store.as_ref(),
            entity_id,
            self.max_commit_retries,
            move || self.plan_confirm(entity_id, attempt, confirmation, now),
        )
        .await?;

        match record.status {
            GraduationStatus::Completed => {
                let pool_address = record.pool_address.clone().unwrap_or_default();
                info!(
                    entity = %entity_id,
                    attempt,
                    pool = %pool_address,
                    tx = %confirmation.tx_hash,
                    "Graduation completed"
                );
                self.events.publish(EngineEvent::Graduated {
                    entity_id: entity_id.to_string(),
                    pool_address,
                });
            }
            _ => {
                let reason = record.failure_reason.clone().unwrap_or_default();
                warn!(entity = %entity_id, attempt, reason = %reason, "Graduation failed");
                self.events.publish(EngineEvent::GraduationFailed {
                    entity_id: entity_id.to_string(),
                    attempt,
                    reason,
                });
            }
        }

        Ok(record)
    }

    async fn plan_confirm(
        &self,
        entity_id: &str,
        attempt: u32,
        confirmation: &ChainConfirmation,
        now: DateTime<Utc>,
    ) -> Result<Plan<GraduationRecord>> {
        let snapshot = self.store.load(entity_id).await?;
        let entity = &snapshot.entity;
        let mut record = find_attempt(entity, attempt)?;
        if record.status.is_terminal() {
            return Err(Error::GraduationNotPending(entity_id.to_string()));
        }

        record.tx_hash = Some(confirmation.tx_hash.clone());
        record.updated_at = now;

        let mutation = match confirmation.status {
            ConfirmationStatus::Success => self.complete(entity, &mut record, confirmation, now)?,
            ConfirmationStatus::Failed => {
                record.status = GraduationStatus::Failed;
                record.failure_reason = Some(
                    confirmation
                        .reason
                        .clone()
                        .unwrap_or_else(|| "execution failed".to_string()),
                );
                LedgerMutation {
                    graduation: Some(record.clone()),
                    ..Default::default()
                }
            }
        };

        Ok(Plan {
            version: snapshot.version,
            mutation: Some(mutation),
            output: record,
        })
    }

    /// Start a new attempt after the latest one failed
    pub async fn retry(&self, entity_id: &str, now: DateTime<Utc>) -> Result<GraduationRecord> {
        let (record, token_address) = commit_with_retry(
            self.store.as_ref(),
            entity_id,
            self.max_commit_retries,
            move || self.plan_retry(entity_id, now),
        )
        .await?;

        info!(entity = %entity_id, attempt = record.attempt, "Graduation retried");
        self.events.publish(EngineEvent::GraduationRequested {
            token_address,
            record: record.clone(),
        });
        Ok(record)
    }

    async fn plan_retry(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan<(GraduationRecord, String)>> {
        let snapshot = self.store.load(entity_id).await?;
        let entity = &snapshot.entity;

        if entity.open_graduation().is_some() {
            return Err(Error::GraduationAlreadyInProgress(entity_id.to_string()));
        }
        let latest = entity
            .latest_graduation()
            .filter(|g| g.status == GraduationStatus::Failed)
            .ok_or_else(|| Error::GraduationNotPending(entity_id.to_string()))?;
        if entity.curve.status != CurveStatus::Graduating {
            return Err(Error::InvalidTransition {
                entity: entity_id.to_string(),
                from: entity.curve.status,
                to: CurveStatus::Graduating,
            });
        }

        let record = self.plan_record(entity, latest.attempt + 1, now)?;
        Ok(Plan {
            version: snapshot.version,
            mutation: Some(LedgerMutation {
                graduation: Some(record.clone()),
                ..Default::default()
            }),
            output: (record, entity.profile.token_address.clone()),
        })
    }

    /// Re-emit the request of a stuck Pending/Processing attempt
    pub async fn redrive(&self, entity_id: &str) -> Result<GraduationRecord> {
        let snapshot = self.store.load(entity_id).await?;
        let record = snapshot
            .entity
            .open_graduation()
            .cloned()
            .ok_or_else(|| Error::GraduationNotPending(entity_id.to_string()))?;

        info!(
            entity = %entity_id,
            attempt = record.attempt,
            status = %record.status,
            "Re-driving graduation request"
        );
        self.events.publish(EngineEvent::GraduationRequested {
            token_address: snapshot.entity.profile.token_address.clone(),
            record: record.clone(),
        });
        Ok(record)
    }

    /// Liquidity split for a new attempt
    fn plan_record(&self, entity: &EntityRecord, attempt: u32, now: DateTime<Utc>) -> Result<GraduationRecord> {
        let curve = &entity.curve;
        let allocation = apply_bps(
            curve.reserve_balance,
            self.config.liquidity_allocation_bps,
            Rounding::Down,
        )?;

        let fees = FeeComposer::compose(allocation, &entity.fee_policies, FeeType::Graduation)?;
        // Burn and auto-liquidity shares of graduation fees never leave the reserve
        let retained = fees.share(FeeRecipient::Burn) + fees.share(FeeRecipient::AutoLiquidity);
        let reserve_allocation = allocation - retained;

        let eth_liquidity = fees
            .net_amount
            .checked_add(entity.auto_liquidity.collected_settlement)
            .ok_or(Error::MathOverflow("graduation eth liquidity"))?;

        // Token leg at spot; collected tokens are already minted, the rest comes
        // from the unsold curve allocation
        let supply = curve.circulating_supply;
        let spot = self.curve.spot_price(supply)?;
        let matched = if spot == 0 {
            0
        } else {
            let tokens = mul_div(eth_liquidity as u128, PRICE_DENOMINATOR, spot, Rounding::Down)?;
            u64::try_from(tokens).unwrap_or(u64::MAX)
        };
        let collected = entity.auto_liquidity.collected_tokens;
        let fresh = matched
            .saturating_sub(collected)
            .min(self.curve.remaining(supply));

        let burn_base = supply
            .checked_add(fresh)
            .ok_or(Error::MathOverflow("graduation burn base"))?;
        let requested_burn = apply_bps(burn_base, self.config.graduation_burn_bps, Rounding::Down)?;
        let graduation_burn = requested_burn.min(fresh);
        if graduation_burn < requested_burn {
            warn!(
                entity = %curve.entity_id,
                attempt,
                requested_burn,
                graduation_burn,
                "Graduation burn capped at the fresh token leg"
            );
        }
        let tokens_to_mint = fresh - graduation_burn;

        Ok(GraduationRecord {
            entity_id: curve.entity_id.clone(),
            attempt,
            status: GraduationStatus::Pending,
            liquidity_bps: self.config.liquidity_allocation_bps,
            reserve_allocation,
            eth_liquidity,
            token_liquidity: collected + tokens_to_mint,
            tokens_to_mint,
            graduation_burn,
            requested_burn,
            graduation_fees: fees.charges,
            pool_address: None,
            tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Mutation closing the curve after a successful graduation
    fn complete(
        &self,
        entity: &EntityRecord,
        record: &mut GraduationRecord,
        confirmation: &ChainConfirmation,
        now: DateTime<Utc>,
    ) -> Result<LedgerMutation> {
        if entity.curve.status != CurveStatus::Graduating {
            return Err(Error::InvalidTransition {
                entity: entity.curve.entity_id.clone(),
                from: entity.curve.status,
                to: CurveStatus::Graduated,
            });
        }
        let pool_address = confirmation
            .pool_address
            .clone()
            .ok_or_else(|| Error::ChainRejected("graduation confirmed without pool address".to_string()))?;

        let mut curve = entity.curve.clone();
        curve.reserve_balance = curve
            .reserve_balance
            .checked_sub(record.reserve_allocation)
            .ok_or_else(|| Error::Internal("reserve below graduation allocation".to_string()))?;
        curve.circulating_supply = curve
            .circulating_supply
            .checked_add(record.tokens_to_mint)
            .ok_or(Error::MathOverflow("graduation mint"))?;
        curve.spot_price = self.curve.spot_price(curve.circulating_supply)?;
        curve.status = CurveStatus::Graduated;
        curve.paused_from = None;
        curve.graduated_at = Some(now);

        let mut burn = entity.burn.clone();
        burn.total_burned = burn
            .total_burned
            .checked_add(record.graduation_burn)
            .ok_or(Error::MathOverflow("graduation burn"))?;

        let mut auto_liquidity = entity.auto_liquidity.clone();
        auto_liquidity.collected_tokens = 0;
        auto_liquidity.collected_settlement = 0;

        let mut accruals = entity.accruals.clone();
        accruals.accrue(&record.graduation_fees)?;

        record.status = GraduationStatus::Completed;
        record.pool_address = Some(pool_address);

        Ok(LedgerMutation {
            curve: Some(curve),
            burn: Some(burn),
            auto_liquidity: Some(auto_liquidity),
            accruals: Some(accruals),
            graduation: Some(record.clone()),
            ..Default::default()
        })
    }
}

fn find_attempt(entity: &EntityRecord, attempt: u32) -> Result<GraduationRecord> {
    entity
        .graduations
        .iter()
        .find(|g| g.attempt == attempt)
        .cloned()
        .ok_or_else(|| Error::GraduationNotPending(entity.curve.entity_id.clone()))
}

fn usd_to_micros(usd: f64) -> Result<u64> {
    if !usd.is_finite() || usd <= 0.0 || usd * USD_MICROS as f64 >= u64::MAX as f64 {
        return Err(Error::Config(format!("invalid reference price: {}", usd)));
    }
    Ok((usd * USD_MICROS as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{CurveParams, TOKEN_UNIT};
    use crate::fees::FeePolicy;
    use crate::ledger::memory::sample_entity;
    use crate::ledger::InMemoryLedger;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<InMemoryLedger>,
        monitor: GraduationMonitor,
        rx: mpsc::Receiver<EngineEvent>,
        curve: PriceCurve,
    }

    async fn fixture(config: GraduationConfig, supply_tokens: u64) -> Fixture {
        let store = Arc::new(InMemoryLedger::new());
        let curve = PriceCurve::new(CurveParams::default()).unwrap();

        let mut entity = sample_entity("tok");
        entity
            .fee_policies
            .push(FeePolicy::percentage(FeeType::Graduation, FeeRecipient::Platform, 500));
        entity.auto_liquidity.collected_settlement = 1_000;
        let supply = supply_tokens * TOKEN_UNIT;
        entity.curve.circulating_supply = supply;
        entity.curve.reserve_balance = curve.cost_to_buy(0, supply).unwrap();
        entity.curve.spot_price = curve.spot_price(supply).unwrap();
        store.create(entity).await.unwrap();

        let (events, rx) = EventSink::channel(16);
        let monitor = GraduationMonitor::new(store.clone(), curve, config, events, 4).unwrap();
        Fixture { store, monitor, rx, curve }
    }

    fn confirmation(key: &str, status: ConfirmationStatus) -> ChainConfirmation {
        ChainConfirmation {
            idempotency_key: key.into(),
            tx_hash: "0xfeed".into(),
            block_number: 100,
            status,
            pool_address: Some("0xpool".into()),
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let mut fx = fixture(GraduationConfig::default(), 50_000_000).await;
        assert!(fx.monitor.check("tok", Utc::now()).await.unwrap().is_none());
        assert_eq!(fx.store.load("tok").await.unwrap().entity.curve.status, CurveStatus::Active);
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_creates_single_pending_record() {
        let mut fx = fixture(GraduationConfig::default(), 110_000_000).await;

        let record = fx.monitor.check("tok", Utc::now()).await.unwrap().unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.status, GraduationStatus::Pending);

        // Idempotent once graduating
        assert!(fx.monitor.check("tok", Utc::now()).await.unwrap().is_none());

        let snapshot = fx.store.load("tok").await.unwrap();
        assert_eq!(snapshot.entity.curve.status, CurveStatus::Graduating);
        assert_eq!(snapshot.entity.graduations.len(), 1);

        match fx.rx.try_recv().unwrap() {
            EngineEvent::GraduationRequested { record: sent, .. } => assert_eq!(sent, record),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_liquidity_split() {
        let fx = fixture(GraduationConfig::default(), 110_000_000).await;
        let reserve = fx.store.load("tok").await.unwrap().entity.curve.reserve_balance;

        let record = fx.monitor.check("tok", Utc::now()).await.unwrap().unwrap();
        let allocation = reserve * 1_700 / 10_000;
        let fee: u64 = record.graduation_fees.iter().map(|c| c.amount).sum();

        assert_eq!(record.reserve_allocation, allocation);
        assert_eq!(record.eth_liquidity, allocation - fee + 1_000);

        // Token leg priced at spot
        let spot = fx.curve.spot_price(110_000_000 * TOKEN_UNIT).unwrap();
        let value = mul_div(record.token_liquidity as u128, spot, PRICE_DENOMINATOR, Rounding::Down).unwrap();
        assert!(value <= record.eth_liquidity as u128);
        assert!(record.eth_liquidity as u128 - value <= 1);
    }

    #[tokio::test]
    async fn test_burn_capped_at_fresh_leg() {
        let mut config = GraduationConfig::default();
        config.graduation_burn_bps = 2_000;
        let fx = fixture(config, 110_000_000).await;

        let record = fx.monitor.check("tok", Utc::now()).await.unwrap().unwrap();
        let fresh = record.tokens_to_mint + record.graduation_burn;
        let burn_base = 110_000_000 * TOKEN_UNIT + fresh;

        assert_eq!(record.requested_burn, burn_base / 5);
        assert!(record.graduation_burn < record.requested_burn);
        assert_eq!(record.graduation_burn, fresh);
        assert_eq!(record.tokens_to_mint, 0);
    }

    #[tokio::test]
    async fn test_confirm_success_graduates() {
        let mut config = GraduationConfig::default();
        config.graduation_burn_bps = 100;
        let fx = fixture(config, 110_000_000).await;
        let before = fx.store.load("tok").await.unwrap().entity;

        let record = fx.monitor.check("tok", Utc::now()).await.unwrap().unwrap();
        fx.monitor.mark_processing("tok", 1, Utc::now()).await.unwrap();

        let confirmed = fx
            .monitor
            .confirm(&confirmation(&record.idempotency_key(), ConfirmationStatus::Success), Utc::now())
            .await
            .unwrap();
        assert_eq!(confirmed.status, GraduationStatus::Completed);
        assert_eq!(confirmed.pool_address.as_deref(), Some("0xpool"));

        let after = fx.store.load("tok").await.unwrap().entity;
        assert_eq!(after.curve.status, CurveStatus::Graduated);
        assert!(after.curve.graduated_at.is_some());
        assert_eq!(
            after.curve.reserve_balance,
            before.curve.reserve_balance - record.reserve_allocation
        );
        assert_eq!(
            after.curve.circulating_supply,
            before.curve.circulating_supply + record.tokens_to_mint
        );
        assert!(record.graduation_burn > 0);
        assert_eq!(record.requested_burn, record.graduation_burn);
        assert_eq!(after.burn.total_burned, record.graduation_burn);
        assert_eq!(after.auto_liquidity.collected_settlement, 0);
        assert!(after.accruals.platform > 0);

        // Graduated is terminal
        assert!(fx.monitor.check("tok", Utc::now()).await.unwrap().is_none());
        assert!(matches!(
            fx.monitor
                .confirm(&confirmation(&record.idempotency_key(), ConfirmationStatus::Success), Utc::now())
                .await,
            Err(Error::GraduationNotPending(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_attempt_and_retry() {
        let fx = fixture(GraduationConfig::default(), 110_000_000).await;
        let first = fx.monitor.check("tok", Utc::now()).await.unwrap().unwrap();

        // Retry only after failure
        assert!(matches!(
            fx.monitor.retry("tok", Utc::now()).await,
            Err(Error::GraduationAlreadyInProgress(_))
        ));

        let mut failed = confirmation(&first.idempotency_key(), ConfirmationStatus::Failed);
        failed.reason = Some("pool creation reverted".into());
        let record = fx.monitor.confirm(&failed, Utc::now()).await.unwrap();
        assert_eq!(record.status, GraduationStatus::Failed);

        let snapshot = fx.store.load("tok").await.unwrap();
        assert_eq!(snapshot.entity.curve.status, CurveStatus::Graduating);

        let second = fx.monitor.retry("tok", Utc::now()).await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.status, GraduationStatus::Pending);

        let graduations = fx.store.load("tok").await.unwrap().entity.graduations;
        assert_eq!(graduations.len(), 2);
        assert_eq!(graduations[0].status, GraduationStatus::Failed);
    }

    #[tokio::test]
    async fn test_redrive_requires_open_attempt() {
        let mut fx = fixture(GraduationConfig::default(), 110_000_000).await;
        assert!(matches!(
            fx.monitor.redrive("tok").await,
            Err(Error::GraduationNotPending(_))
        ));

        fx.monitor.check("tok", Utc::now()).await.unwrap();
        let _ = fx.rx.try_recv();

        let record = fx.monitor.redrive("tok").await.unwrap();
        assert_eq!(record.attempt, 1);
        assert!(matches!(
            fx.rx.try_recv().unwrap(),
            EngineEvent::GraduationRequested { .. }
        ));
    }

    #[tokio::test]
    async fn test_reference_price_moves_threshold() {
        let fx = fixture(GraduationConfig::default(), 100_000_000).await;
        // r = 0.1: cap = 1e13 * 0.1^2.5 gwei ~= 31.6 ETH ~= $94.9k at $3000
        assert!(!fx.monitor.threshold_reached(100_000_000 * TOKEN_UNIT).unwrap());

        fx.monitor.set_reference_price(3_500.0).unwrap();
        assert_eq!(fx.monitor.reference_price(), 3_500.0);
        assert!(fx.monitor.threshold_reached(100_000_000 * TOKEN_UNIT).unwrap());

        assert!(fx.monitor.set_reference_price(-1.0).is_err());
    }

    #[tokio::test]
    async fn test_progress() {
        let fx = fixture(GraduationConfig::default(), 100_000_000).await;
        let progress = fx.monitor.progress(400_000_000 * TOKEN_UNIT).unwrap();
        // 40% of supply against an 80% display target
        assert_eq!(progress.supply_fraction_bps, 5_000);
        assert!(progress.market_cap_bps > 10_000);
    }
}

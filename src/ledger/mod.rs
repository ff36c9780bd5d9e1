//! Ledger store contract
//!
//! The engine reads a versioned snapshot of one entity, computes a
//! [`LedgerMutation`] without holding any lock, and commits it guarded by the
//! version it read. A stale version fails with `Error::VersionConflict` and the
//! engine retries from a fresh read. Unrelated entities never contend.

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::types::{
    CurveState, EntityId, GraduationRecord, GraduationStatus, Holder, TokenProfile, TradeRecord,
};
use crate::error::Result;
use crate::fair_launch::{FairLaunchConfig, FairLaunchParticipant};
use crate::fees::{AutoLiquidityConfig, BurnConfig, FeeAccruals, FeePolicy};

pub use memory::InMemoryLedger;
pub use snapshot::{LedgerSnapshot, CURRENT_SCHEMA_VERSION};

/// Everything owned by one entity except per-address records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub profile: TokenProfile,
    pub curve: CurveState,
    pub fair_launch: FairLaunchConfig,
    pub fee_policies: Vec<FeePolicy>,
    pub burn: BurnConfig,
    pub auto_liquidity: AutoLiquidityConfig,
    #[serde(default)]
    pub accruals: FeeAccruals,
    #[serde(default)]
    pub graduations: Vec<GraduationRecord>,
}

impl EntityRecord {
    pub fn entity_id(&self) -> &str {
        &self.curve.entity_id
    }

    /// Configured policies plus the burn and auto-liquidity shares
    pub fn policies(&self) -> Vec<FeePolicy> {
        let mut policies = self.fee_policies.clone();
        policies.extend(self.burn.as_policy());
        policies.extend(self.auto_liquidity.as_policy());
        policies
    }

    /// Most recent graduation attempt
    pub fn latest_graduation(&self) -> Option<&GraduationRecord> {
        self.graduations.iter().max_by_key(|g| g.attempt)
    }

    /// Attempt that is neither failed nor completed
    pub fn open_graduation(&self) -> Option<&GraduationRecord> {
        self.graduations
            .iter()
            .find(|g| matches!(g.status, GraduationStatus::Pending | GraduationStatus::Processing))
    }
}

/// Entity record as of a committed version
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub version: u64,
    pub entity: EntityRecord,
}

/// All writes of one operation, applied together or not at all
#[derive(Debug, Clone, Default)]
pub struct LedgerMutation {
    pub curve: Option<CurveState>,
    pub fair_launch: Option<FairLaunchConfig>,
    pub burn: Option<BurnConfig>,
    pub auto_liquidity: Option<AutoLiquidityConfig>,
    pub accruals: Option<FeeAccruals>,
    /// Upserted by address
    pub holders: Vec<Holder>,
    /// Upserted by buyer
    pub participants: Vec<FairLaunchParticipant>,
    /// Appended; its `tx_ref`, if any, must be new
    pub trade: Option<TradeRecord>,
    /// Upserted by attempt
    pub graduation: Option<GraduationRecord>,
}

/// Persistent per-entity records required by the engine
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Register a new entity at version 1
    async fn create(&self, entity: EntityRecord) -> Result<()>;

    /// Current committed snapshot
    async fn load(&self, entity_id: &str) -> Result<EntitySnapshot>;

    async fn holder(&self, entity_id: &str, address: &str) -> Result<Option<Holder>>;

    async fn holders(&self, entity_id: &str) -> Result<Vec<Holder>>;

    async fn participant(
        &self,
        entity_id: &str,
        buyer: &str,
    ) -> Result<Option<FairLaunchParticipant>>;

    /// Most recent trades first
    async fn trades(&self, entity_id: &str, limit: usize) -> Result<Vec<TradeRecord>>;

    async fn has_trade_ref(&self, entity_id: &str, tx_ref: &str) -> Result<bool>;

    /// Apply `mutation` if the entity is still at `expected_version`; returns the new version
    async fn commit(
        &self,
        entity_id: &str,
        expected_version: u64,
        mutation: LedgerMutation,
    ) -> Result<u64>;

    async fn entity_ids(&self) -> Result<Vec<EntityId>>;
}

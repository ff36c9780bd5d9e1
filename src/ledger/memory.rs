//! In-memory ledger backed by DashMap
//!
//! Each entity lives in its own map entry; a commit holds that entry's shard
//! lock only for the version check and the apply.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::snapshot::{self, LedgerSnapshot};
use super::{EntityRecord, EntitySnapshot, LedgerMutation, LedgerStore};
use crate::engine::types::{EntityId, Holder, TradeRecord};
use crate::error::{Error, Result};
use crate::fair_launch::FairLaunchParticipant;

/// All records of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBook {
    pub version: u64,
    pub entity: EntityRecord,
    #[serde(default)]
    pub holders: BTreeMap<String, Holder>,
    #[serde(default)]
    pub participants: BTreeMap<String, FairLaunchParticipant>,
    #[serde(default)]
    pub trades: Vec<TradeRecord>,
    #[serde(skip)]
    trade_refs: BTreeSet<String>,
}

impl EntityBook {
    fn new(entity: EntityRecord) -> Self {
        Self {
            version: 1,
            entity,
            holders: BTreeMap::new(),
            participants: BTreeMap::new(),
            trades: Vec::new(),
            trade_refs: BTreeSet::new(),
        }
    }

    /// Rebuild derived indexes after deserialization
    pub(crate) fn reindex(&mut self) {
        self.trade_refs = self
            .trades
            .iter()
            .filter_map(|t| t.tx_ref.clone())
            .collect();
    }

    fn apply(&mut self, mutation: LedgerMutation) {
        if let Some(curve) = mutation.curve {
            self.entity.curve = curve;
        }
        if let Some(fair_launch) = mutation.fair_launch {
            self.entity.fair_launch = fair_launch;
        }
        if let Some(burn) = mutation.burn {
            self.entity.burn = burn;
        }
        if let Some(auto_liquidity) = mutation.auto_liquidity {
            self.entity.auto_liquidity = auto_liquidity;
        }
        if let Some(accruals) = mutation.accruals {
            self.entity.accruals = accruals;
        }
        for holder in mutation.holders {
            self.holders.insert(holder.address.clone(), holder);
        }
        for participant in mutation.participants {
            self.participants.insert(participant.buyer.clone(), participant);
        }
        if let Some(trade) = mutation.trade {
            if let Some(tx_ref) = &trade.tx_ref {
                self.trade_refs.insert(tx_ref.clone());
            }
            self.trades.push(trade);
        }
        if let Some(graduation) = mutation.graduation {
            match self
                .entity
                .graduations
                .iter_mut()
                .find(|g| g.attempt == graduation.attempt)
            {
                Some(existing) => *existing = graduation,
                None => self.entity.graduations.push(graduation),
            }
        }
    }
}

/// Ledger held in process memory, persisted through JSON snapshots
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    books: DashMap<EntityId, EntityBook>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the snapshot at `path`, or start empty if there is none
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "No ledger snapshot, starting empty");
            return Ok(Self::new());
        }

        let snapshot = snapshot::read(path).await?;
        let ledger = Self::from_snapshot(snapshot);
        info!(
            path = %path.display(),
            entities = ledger.books.len(),
            "Loaded ledger snapshot"
        );
        Ok(ledger)
    }

    /// Persist the current state to `path`
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.to_snapshot();
        snapshot::write(path, &snapshot).await?;
        debug!(path = %path.display(), entities = snapshot.entities.len(), "Saved ledger snapshot");
        Ok(())
    }

    pub fn to_snapshot(&self) -> LedgerSnapshot {
        let mut entities: Vec<EntityBook> = self.books.iter().map(|e| e.value().clone()).collect();
        entities.sort_by(|a, b| a.entity.entity_id().cmp(b.entity.entity_id()));
        LedgerSnapshot::new(entities)
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let books = DashMap::new();
        for mut book in snapshot.entities {
            book.reindex();
            books.insert(book.entity.entity_id().to_string(), book);
        }
        Self { books }
    }

    fn not_found(entity_id: &str) -> Error {
        Error::EntityNotFound(entity_id.to_string())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create(&self, entity: EntityRecord) -> Result<()> {
        let entity_id = entity.entity_id().to_string();
        match self.books.entry(entity_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::EntityExists(entity_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(EntityBook::new(entity));
                Ok(())
            }
        }
    }

    async fn load(&self, entity_id: &str) -> Result<EntitySnapshot> {
        let book = self
            .books
            .get(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;
        Ok(EntitySnapshot {
            version: book.version,
            entity: book.entity.clone(),
        })
    }

    async fn holder(&self, entity_id: &str, address: &str) -> Result<Option<Holder>> {
        let book = self
            .books
            .get(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;
        Ok(book.holders.get(address).cloned())
    }

    async fn holders(&self, entity_id: &str) -> Result<Vec<Holder>> {
        let book = self
            .books
            .get(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;
        Ok(book.holders.values().cloned().collect())
    }

    async fn participant(
        &self,
        entity_id: &str,
        buyer: &str,
    ) -> Result<Option<FairLaunchParticipant>> {
        let book = self
            .books
            .get(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;
        Ok(book.participants.get(buyer).cloned())
    }

    async fn trades(&self, entity_id: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        let book = self
            .books
            .get(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;
        Ok(book.trades.iter().rev().take(limit).cloned().collect())
    }

    async fn has_trade_ref(&self, entity_id: &str, tx_ref: &str) -> Result<bool> {
        let book = self
            .books
            .get(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;
        Ok(book.trade_refs.contains(tx_ref))
    }

    async fn commit(
        &self,
        entity_id: &str,
        expected_version: u64,
        mutation: LedgerMutation,
    ) -> Result<u64> {
        let mut book = self
            .books
            .get_mut(entity_id)
            .ok_or_else(|| Self::not_found(entity_id))?;

        if book.version != expected_version {
            return Err(Error::VersionConflict {
                entity: entity_id.to_string(),
                expected: expected_version,
                found: book.version,
            });
        }

        if let Some(tx_ref) = mutation.trade.as_ref().and_then(|t| t.tx_ref.as_ref()) {
            if book.trade_refs.contains(tx_ref) {
                return Err(Error::DuplicateTrade(tx_ref.clone()));
            }
        }

        book.apply(mutation);
        book.version += 1;
        Ok(book.version)
    }

    async fn entity_ids(&self) -> Result<Vec<EntityId>> {
        let mut ids: Vec<EntityId> = self.books.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Minimal entity used by tests across the crate
#[cfg(test)]
pub(crate) fn sample_entity(entity_id: &str) -> EntityRecord {
    use crate::engine::types::{CurveState, TokenProfile};
    use crate::fair_launch::FairLaunchConfig;
    use crate::fees::{AutoLiquidityConfig, BurnConfig, FeeAccruals, FeePolicy, FeeRecipient, FeeType};
    use chrono::Utc;

    let now = Utc::now();
    EntityRecord {
        profile: TokenProfile {
            name: "Sample".into(),
            symbol: "SMPL".into(),
            creator: "0x1111111111111111111111111111111111111111".into(),
            token_address: "0x2222222222222222222222222222222222222222".into(),
        },
        curve: CurveState::new(entity_id, now),
        fair_launch: FairLaunchConfig::disabled(entity_id, now),
        fee_policies: vec![
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::Platform, 100),
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::Creator, 100),
        ],
        burn: BurnConfig::new(entity_id, 0),
        auto_liquidity: AutoLiquidityConfig::new(entity_id, 0),
        accruals: FeeAccruals::default(),
        graduations: Vec::new(),
    }
}

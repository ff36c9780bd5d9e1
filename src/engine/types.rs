//! Ledger records owned by the engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fees::FeeCharge;

/// Entity identifier (one launched token)
pub type EntityId = String;

/// Lifecycle status of a bonding curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveStatus {
    Active,
    Graduating,
    Graduated,
    Paused,
}

impl CurveStatus {
    /// Buys and sells are only accepted while active
    pub fn is_tradeable(&self) -> bool {
        matches!(self, CurveStatus::Active)
    }

    /// Operators may pause an active or graduating curve
    pub fn can_pause(&self) -> bool {
        matches!(self, CurveStatus::Active | CurveStatus::Graduating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CurveStatus::Graduated)
    }
}

impl fmt::Display for CurveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurveStatus::Active => write!(f, "active"),
            CurveStatus::Graduating => write!(f, "graduating"),
            CurveStatus::Graduated => write!(f, "graduated"),
            CurveStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Aggregate root for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveState {
    pub entity_id: EntityId,
    /// Minted minus burned, token base units
    pub circulating_supply: u64,
    /// Settlement held by the curve, base units
    pub reserve_balance: u64,
    /// WAD-scaled settlement base units per whole token
    #[serde(with = "wad_string")]
    pub spot_price: u128,
    pub total_volume: u64,
    pub total_transactions: u64,
    pub holder_count: u32,
    pub status: CurveStatus,
    /// Status to restore on resume, set only while paused
    #[serde(default)]
    pub paused_from: Option<CurveStatus>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub graduated_at: Option<DateTime<Utc>>,
}

impl CurveState {
    pub fn new(entity_id: impl Into<EntityId>, created_at: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            circulating_supply: 0,
            reserve_balance: 0,
            spot_price: 0,
            total_volume: 0,
            total_transactions: 0,
            holder_count: 0,
            status: CurveStatus::Active,
            paused_from: None,
            created_at,
            graduated_at: None,
        }
    }
}

/// Descriptive metadata of a launched token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenProfile {
    pub name: String,
    pub symbol: String,
    pub creator: String,
    /// Address of the deployed token contract
    pub token_address: String,
}

/// Per-address position in one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    pub entity_id: EntityId,
    pub address: String,
    pub balance: u64,
    pub total_bought: u64,
    pub total_sold: u64,
    /// Volume-weighted, WAD-scaled settlement base units per whole token
    #[serde(with = "wad_string")]
    pub average_buy_price: u128,
}

impl Holder {
    pub fn new(entity_id: impl Into<EntityId>, address: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            address: address.into(),
            balance: 0,
            total_bought: 0,
            total_sold: 0,
            average_buy_price: 0,
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeKind::Buy => write!(f, "buy"),
            TradeKind::Sell => write!(f, "sell"),
        }
    }
}

/// Immutable record of an executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub kind: TradeKind,
    pub trader: String,
    /// Settlement for buys, tokens for sells
    pub amount_in: u64,
    /// Tokens for buys, settlement for sells
    pub amount_out: u64,
    /// Execution price, WAD-scaled settlement base units per whole token
    #[serde(with = "wad_string")]
    pub price: u128,
    pub fees_applied: Vec<FeeCharge>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tx_ref: Option<String>,
}

/// Graduation attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraduationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl GraduationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GraduationStatus::Completed | GraduationStatus::Failed)
    }
}

impl fmt::Display for GraduationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraduationStatus::Pending => write!(f, "pending"),
            GraduationStatus::Processing => write!(f, "processing"),
            GraduationStatus::Completed => write!(f, "completed"),
            GraduationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One graduation attempt. A failed attempt is never reused; retries append a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraduationRecord {
    pub entity_id: EntityId,
    /// 1-based attempt number
    pub attempt: u32,
    pub status: GraduationStatus,
    /// Share of the reserve allocated to the pool, bps
    pub liquidity_bps: u64,
    /// Reserve withdrawn on completion (pool liquidity plus graduation fees)
    pub reserve_allocation: u64,
    /// Settlement deposited into the pool
    pub eth_liquidity: u64,
    /// Tokens deposited into the pool
    pub token_liquidity: u64,
    /// Part of `token_liquidity` minted on completion
    pub tokens_to_mint: u64,
    /// Tokens minted and burned on completion instead of entering the pool
    pub graduation_burn: u64,
    /// Configured burn before capping at the fresh token leg
    #[serde(default)]
    pub requested_burn: u64,
    pub graduation_fees: Vec<FeeCharge>,
    #[serde(default)]
    pub pool_address: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraduationRecord {
    /// Idempotency key used for the graduation hand-off
    pub fn idempotency_key(&self) -> String {
        format!("{}:graduation:{}", self.entity_id, self.attempt)
    }

    /// Split an idempotency key back into entity and attempt
    pub fn parse_idempotency_key(key: &str) -> Option<(EntityId, u32)> {
        let (entity_id, attempt) = key.rsplit_once(":graduation:")?;
        Some((entity_id.to_string(), attempt.parse().ok()?))
    }
}

/// Serialize WAD-scaled u128 values as decimal strings so they survive
/// `serde_json::Value` round trips.
pub(crate) mod wad_string {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u128>().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_rules() {
        assert!(CurveStatus::Active.is_tradeable());
        assert!(!CurveStatus::Graduating.is_tradeable());
        assert!(CurveStatus::Graduating.can_pause());
        assert!(!CurveStatus::Graduated.can_pause());
        assert!(CurveStatus::Graduated.is_terminal());
        assert_eq!(CurveStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_curve_state_serde() {
        let mut state = CurveState::new("tok", Utc::now());
        state.spot_price = u128::MAX;

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"status\":\"active\""));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let decoded: CurveState = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_graduation_key() {
        let now = Utc::now();
        let record = GraduationRecord {
            entity_id: "tok".into(),
            attempt: 2,
            status: GraduationStatus::Pending,
            liquidity_bps: 1_700,
            reserve_allocation: 0,
            eth_liquidity: 0,
            token_liquidity: 0,
            tokens_to_mint: 0,
            graduation_burn: 0,
            requested_burn: 0,
            graduation_fees: vec![],
            pool_address: None,
            tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.idempotency_key(), "tok:graduation:2");
        assert_eq!(
            GraduationRecord::parse_idempotency_key("tok:graduation:2"),
            Some(("tok".to_string(), 2))
        );
        assert_eq!(GraduationRecord::parse_idempotency_key("tok:buy:2"), None);
        assert!(!record.status.is_terminal());
    }
}

//! Chain Execution Service payloads
//!
//! Call data is Borsh-encoded arguments prefixed with an 8-byte discriminator,
//! the first 8 bytes of SHA-256("global:<instruction_name>"), and travels
//! base64-encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::{GraduationRecord, TradeExecuted, TradeKind};
use crate::error::{Error, Result};

/// Settlement base units (gwei) to wei
const WEI_PER_BASE_UNIT: u128 = 1_000_000_000;

/// Instruction names hashed into discriminators
pub mod instructions {
    pub const BUY: &str = "buy";
    pub const SELL: &str = "sell";
}

/// First 8 bytes of SHA-256("global:<name>")
pub fn discriminator(name: &str) -> [u8; 8] {
    let hash = Sha256::digest(format!("global:{}", name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// Arguments of the router's buy and sell instructions
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TradeArgs {
    pub token: String,
    pub trader: String,
    /// Settlement for buys, tokens for sells, base units
    pub amount_in: u64,
    /// Floor the router enforces on chain
    pub min_out: u64,
}

/// Router call for an applied trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCall {
    pub to: String,
    /// Base64 of discriminator followed by Borsh [`TradeArgs`]
    pub data: String,
    /// Native value attached, wei as a decimal string
    pub value: String,
    pub expected_out: String,
    pub idempotency_key: String,
}

/// Liquidity add for a graduating curve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraduationCall {
    pub token_address: String,
    /// Wei as a decimal string
    pub eth_amount: String,
    /// Token base units as a decimal string
    pub token_amount: String,
    pub idempotency_key: String,
}

/// Anything submitted to the Chain Execution Service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainPayload {
    Trade(TradeCall),
    Graduation(GraduationCall),
}

impl ChainPayload {
    pub fn idempotency_key(&self) -> &str {
        match self {
            ChainPayload::Trade(call) => &call.idempotency_key,
            ChainPayload::Graduation(call) => &call.idempotency_key,
        }
    }

    pub fn is_graduation(&self) -> bool {
        matches!(self, ChainPayload::Graduation(_))
    }
}

pub fn trade_call(router_address: &str, trade: &TradeExecuted) -> Result<TradeCall> {
    let (name, value) = match trade.kind {
        TradeKind::Buy => (instructions::BUY, to_wei(trade.amount_in)),
        TradeKind::Sell => (instructions::SELL, 0),
    };

    let args = TradeArgs {
        token: trade.token_address.clone(),
        trader: trade.trader.clone(),
        amount_in: trade.amount_in,
        min_out: trade.min_out,
    };

    Ok(TradeCall {
        to: router_address.to_string(),
        data: encode_instruction(name, &args)?,
        value: value.to_string(),
        expected_out: trade.amount_out.to_string(),
        idempotency_key: trade.idempotency_key.clone(),
    })
}

pub fn graduation_call(token_address: &str, record: &GraduationRecord) -> GraduationCall {
    GraduationCall {
        token_address: token_address.to_string(),
        eth_amount: to_wei(record.eth_liquidity).to_string(),
        token_amount: record.token_liquidity.to_string(),
        idempotency_key: record.idempotency_key(),
    }
}

/// Discriminator plus Borsh arguments, base64-encoded
pub fn encode_instruction<T: BorshSerialize>(name: &str, args: &T) -> Result<String> {
    let mut data = discriminator(name).to_vec();
    args.serialize(&mut data)
        .map_err(|e| Error::Serialization(format!("instruction {}: {}", name, e)))?;
    Ok(STANDARD.encode(data))
}

/// Inverse of [`encode_instruction`]
pub fn decode_instruction<T: BorshDeserialize>(name: &str, data: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| Error::Deserialization(format!("instruction data: {}", e)))?;
    if bytes.len() < 8 || bytes[..8] != discriminator(name) {
        return Err(Error::Deserialization(format!(
            "instruction data is not a {} call",
            name
        )));
    }
    T::try_from_slice(&bytes[8..])
        .map_err(|e| Error::Deserialization(format!("instruction {}: {}", name, e)))
}

fn to_wei(amount: u64) -> u128 {
    amount as u128 * WEI_PER_BASE_UNIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GraduationStatus;
    use chrono::Utc;

    fn buy_event() -> TradeExecuted {
        TradeExecuted {
            entity_id: "tok".into(),
            token_address: "0x2222222222222222222222222222222222222222".into(),
            kind: TradeKind::Buy,
            trader: "0x3333333333333333333333333333333333333333".into(),
            amount_in: 1_500_000_000,
            amount_out: 42_000,
            min_out: 41_000,
            idempotency_key: "0xhash".into(),
        }
    }

    #[test]
    fn test_discriminator() {
        // Matches the well-known Anchor value for "buy"
        assert_eq!(discriminator(instructions::BUY), [102, 6, 61, 18, 1, 218, 235, 234]);
        assert_ne!(discriminator(instructions::BUY), discriminator(instructions::SELL));
    }

    #[test]
    fn test_trade_call() {
        let call = trade_call("0x9999999999999999999999999999999999999999", &buy_event()).unwrap();

        assert_eq!(call.value, "1500000000000000000");
        assert_eq!(call.expected_out, "42000");
        assert_eq!(call.idempotency_key, "0xhash");

        let args: TradeArgs = decode_instruction(instructions::BUY, &call.data).unwrap();
        assert_eq!(args.amount_in, 1_500_000_000);
        assert_eq!(args.min_out, 41_000);
        assert!(decode_instruction::<TradeArgs>(instructions::SELL, &call.data).is_err());

        let json = serde_json::to_value(&call).unwrap();
        assert!(json.get("expectedOut").is_some());
        assert!(json.get("idempotencyKey").is_some());
    }

    #[test]
    fn test_sell_carries_no_value() {
        let mut event = buy_event();
        event.kind = TradeKind::Sell;
        let call = trade_call("0x9999999999999999999999999999999999999999", &event).unwrap();
        assert_eq!(call.value, "0");
    }

    #[test]
    fn test_graduation_call() {
        let now = Utc::now();
        let record = GraduationRecord {
            entity_id: "tok".into(),
            attempt: 1,
            status: GraduationStatus::Pending,
            liquidity_bps: 1_700,
            reserve_allocation: 3_000_000_000,
            eth_liquidity: 2_500_000_000,
            token_liquidity: 7_000_000_000_000_000,
            tokens_to_mint: 7_000_000_000_000_000,
            graduation_burn: 0,
            requested_burn: 0,
            graduation_fees: vec![],
            pool_address: None,
            tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        let call = graduation_call("0x2222222222222222222222222222222222222222", &record);
        assert_eq!(call.eth_amount, "2500000000000000000");
        assert_eq!(call.token_amount, "7000000000000000");
        assert_eq!(call.idempotency_key, "tok:graduation:1");
        assert!(ChainPayload::Graduation(call).is_graduation());
    }
}

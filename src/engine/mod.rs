//! Trade orchestration and graduation
//!
//! Every operation follows the same shape: load a versioned snapshot, plan
//! the full mutation off-lock, commit it guarded by the version, and publish
//! events only after the commit succeeded.

pub mod bonding;
pub mod events;
pub mod graduation;
pub mod types;

use std::future::Future;

use tracing::debug;

use crate::error::{Error, Result};
use crate::ledger::{LedgerMutation, LedgerStore};

pub use bonding::{
    BondingCurveEngine, BuyQuote, BuyRequest, CurveReport, LaunchRequest, SellQuote, SellRequest,
    TradeReceipt,
};
pub use events::{EngineEvent, EventSink, TradeExecuted};
pub use graduation::{ChainConfirmation, ConfirmationStatus, GraduationMonitor};
pub use types::{
    CurveState, CurveStatus, EntityId, GraduationRecord, GraduationStatus, Holder, TokenProfile,
    TradeKind, TradeRecord,
};

/// Outcome of planning one operation against a snapshot
pub(crate) struct Plan<T> {
    /// Version the plan was computed from
    pub version: u64,
    /// `None` when there is nothing to write
    pub mutation: Option<LedgerMutation>,
    pub output: T,
}

/// Plan and commit until the commit lands on an unchanged version.
///
/// Only version conflicts are retried; every other error is returned as is.
pub(crate) async fn commit_with_retry<T, F, Fut>(
    store: &dyn LedgerStore,
    entity_id: &str,
    max_attempts: u32,
    mut plan: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Plan<T>>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let Plan {
            version,
            mutation,
            output,
        } = plan().await?;

        let Some(mutation) = mutation else {
            return Ok(output);
        };

        match store.commit(entity_id, version, mutation).await {
            Ok(_) => return Ok(output),
            Err(Error::VersionConflict { found, .. }) if attempt < max_attempts => {
                debug!(
                    entity = %entity_id,
                    attempt,
                    expected = version,
                    found,
                    "Version conflict, replanning"
                );
            }
            Err(Error::VersionConflict { .. }) => {
                return Err(Error::RetriesExhausted {
                    entity: entity_id.to_string(),
                    attempts: attempt,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

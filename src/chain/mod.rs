//! Chain Execution Service collaborator
//!
//! The core never talks to a chain directly. After a commit, the dispatcher
//! turns engine events into payloads and submits them through a
//! [`ChainExecutor`]; confirmations come back keyed by idempotency key.

pub mod dispatcher;
pub mod http;
pub mod payload;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use crate::engine::{ChainConfirmation, ConfirmationStatus};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use http::HttpChainExecutor;
pub use payload::{ChainPayload, GraduationCall, TradeCall};

/// Acknowledgement of a submitted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub idempotency_key: String,
    /// Transaction hash if the service already broadcast it
    #[serde(default)]
    pub tx_hash: Option<String>,
}

/// Submits payloads to the Chain Execution Service
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    /// Key of the circuit breaker guarding this executor
    fn endpoint(&self) -> &str;

    /// Submit a payload; resubmitting the same idempotency key is safe
    async fn submit(&self, payload: &ChainPayload) -> Result<Submission>;

    /// Confirmation for `idempotency_key`, if the service has one
    async fn confirmation(&self, idempotency_key: &str) -> Result<Option<ChainConfirmation>>;
}

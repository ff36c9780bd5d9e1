//! Error types for the launchpad engine

use thiserror::Error;

use crate::engine::types::CurveStatus;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the launchpad engine
#[derive(Error, Debug)]
pub enum Error {
    // Trade rejections
    #[error("Curve {entity} is not active (status: {status})")]
    CurveNotActive { entity: String, status: CurveStatus },

    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    #[error("Slippage exceeded: expected at least {expected}, got {actual}")]
    SlippageExceeded { expected: u64, actual: u64 },

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("Fee configuration error: {0}")]
    FeeConfig(String),

    #[error("Graduation already in progress for {0}")]
    GraduationAlreadyInProgress(String),

    #[error("Tokens still vesting: {locked} locked, {requested} requested, {unlocked} unlocked")]
    VestingLocked {
        locked: u64,
        requested: u64,
        unlocked: u64,
    },

    #[error("Duplicate trade reference: {0}")]
    DuplicateTrade(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Supply exhausted: {requested} requested, {remaining} remaining on curve")]
    SupplyExhausted { requested: u64, remaining: u64 },

    #[error("Math overflow in {0}")]
    MathOverflow(&'static str),

    // Ledger errors
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity already exists: {0}")]
    EntityExists(String),

    #[error("Fair launch config for {0} is locked (trading enabled)")]
    ConfigLocked(String),

    #[error("No pending graduation for {0}")]
    GraduationNotPending(String),

    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: CurveStatus,
        to: CurveStatus,
    },

    #[error("Version conflict on {entity}: expected {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: u64,
        found: u64,
    },

    #[error("Gave up on {entity} after {attempts} conflicting commits")]
    RetriesExhausted { entity: String, attempts: u32 },

    #[error("Ledger persistence failed: {0}")]
    Persistence(String),

    // Chain execution errors
    #[error("Chain execution failed: {0}")]
    ChainExecution(String),

    #[error("Chain execution rejected: {0}")]
    ChainRejected(String),

    #[error("Chain execution timeout after {0}ms")]
    ChainTimeout(u64),

    #[error("Circuit open for {key}, retry in {retry_in_secs}s")]
    CircuitOpen { key: String, retry_in_secs: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. }
                | Error::ChainExecution(_)
                | Error::ChainTimeout(_)
        )
    }

    /// Check if this error is a trade rejection scoped to a single attempt
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::CurveNotActive { .. }
                | Error::AdmissionDenied(_)
                | Error::SlippageExceeded { .. }
                | Error::InsufficientBalance { .. }
                | Error::FeeConfig(_)
                | Error::GraduationAlreadyInProgress(_)
                | Error::VestingLocked { .. }
                | Error::DuplicateTrade(_)
                | Error::InvalidAmount(_)
                | Error::SupplyExhausted { .. }
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::ChainTimeout(0)
        } else {
            Error::ChainExecution(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::ChainTimeout(500).is_retryable());
        assert!(!Error::AdmissionDenied("blacklisted".into()).is_retryable());

        assert!(Error::SlippageExceeded { expected: 10, actual: 9 }.is_rejection());
        assert!(!Error::Persistence("disk full".into()).is_rejection());
    }

    #[test]
    fn test_display() {
        let err = Error::CurveNotActive {
            entity: "tok".into(),
            status: CurveStatus::Graduating,
        };
        assert_eq!(err.to_string(), "Curve tok is not active (status: graduating)");
    }
}

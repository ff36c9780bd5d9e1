//! Launchpad core
//!
//! Bonding-curve token launches: pricing, fee composition, fair-launch
//! admission, versioned ledger commits and graduation into a liquidity pool.
//! Chain execution is delegated to an external service.

pub mod chain;
pub mod cli;
pub mod config;
pub mod curve;
pub mod engine;
pub mod error;
pub mod fair_launch;
pub mod fees;
pub mod ledger;
pub mod resilience;

// Re-export commonly used types
pub use config::Config;
pub use engine::{BondingCurveEngine, EngineEvent, GraduationMonitor};
pub use error::{Error, Result};

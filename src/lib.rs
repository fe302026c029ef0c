//! ArmorCode Release Gate
//!
//! A Rust implementation of the release gate used in CI pipelines:
//! - Gate validation state machine (poll / hold / retry / block-or-warn)
//! - Response classification and failure explanations
//! - Periodic pipeline discovery with heuristic gate detection
//! - Batched delivery of discovery reports

pub mod api;
pub mod config;
pub mod discovery;
pub mod gate;
pub mod utils;

// Re-exports for convenience
pub use config::{GateParams, Settings, SettingsStore};
pub use discovery::{DiscoveryScheduler, DiscoveryService, JobScanner};
pub use gate::{GateError, GateOutcome, GateResult, GateStateMachine};

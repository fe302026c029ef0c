//! Gate Module
//!
//! Release gate validation: transport, classification, invocation recording
//! and the polling state machine.

pub mod classifier;
pub mod client;
pub mod error;
pub mod machine;
pub mod recorder;
pub mod types;

pub use classifier::{classify, explain, ExplainContext};
pub use client::{GateTransport, HttpGateClient};
pub use error::GateError;
pub use machine::GateStateMachine;
pub use recorder::{ConsoleInvocation, GateMetadata, InvocationContext, MemoryInvocation, RunDirInvocation};
pub use types::{
    BuildIdentity, GateOutcome, GateRequest, GateResponse, GateResult, GateStatus, Mode, RiskCounts,
    SeverityCounts, SubProductsInput,
};

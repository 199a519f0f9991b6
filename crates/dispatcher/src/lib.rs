//! Worker execution engine
//!
//! Startup dependency validation, the per-worker scheduling loops and the
//! resilience layer (timeout, retry, outcome classification) they run each trigger through.

pub mod dependency_checker;
pub mod retry_service;
pub mod scheduler;
pub mod scope;

pub use dependency_checker::{DependencyChecker, DependencyIssue};
pub use retry_service::{
    classify, AttemptOutcome, AttemptResult, ExecutionOutcome, FailureDisposition,
    ResilienceEngine,
};
pub use scheduler::{LoopExit, WorkerLoop};
pub use scope::ScopeGuard;

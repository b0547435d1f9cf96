//! Error types for the finance insight orchestrator
//!
//! Provider failures and validation rejections are recoverable and handled
//! inside the provider chain and the repair loop; they never surface here.
//! Only fatal conditions (missing mandatory capability, job timeout,
//! internal faults) propagate to job status.

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Stage error: {0}")]
    Stage(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("State persistence error: {0}")]
    State(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Job exceeded its wall-clock budget of {0}s")]
    Timeout(u64),

    #[error("Job was cancelled")]
    Cancelled,

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

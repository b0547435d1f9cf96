//! Finance Insight Orchestrator
//!
//! A staged research pipeline for financial questions:
//! - Decomposes a request into plan / research / quant / draft stages
//! - Audits every stage output through a deterministic validation gate
//! - Repairs rejected stages exactly once before marking them failed
//! - Computes every number in a restricted sandbox (LLM excluded from math)
//! - Records all attempts in an append-only, hash-verified context log
//!
//! PIPELINE:
//! PLAN → RESEARCH → AUDIT → QUANT → AUDIT → DRAFT → AUDIT → FINAL REPORT

pub mod api;
pub mod config;
pub mod error;
pub mod integrity;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod sandbox;
pub mod stages;
pub mod state;
pub mod trace;
pub mod validation;

pub use error::Result;

// Re-export common types
pub use models::*;

//! Stage executors for the research pipeline
//!
//! Each stage turns the request plus the context log so far into one
//! `StageOutput`. Stages read the log but never write it; the orchestrator
//! is the only writer. A stage must never fabricate a number: every numeric
//! value it emits traces to a provider result or a sandbox run.

use crate::models::{ContextLog, Request, StageName, StageOutput};
use crate::trace::TraceSink;
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub mod draft;
pub mod plan;
pub mod quant;
pub mod research;

pub use draft::DraftStage;
pub use plan::{ModulePlan, PlanPayload, PlanStage, QuantRequest, ResearchRequest};
pub use quant::QuantStage;
pub use research::ResearchStage;

/// Read-only view a stage gets for one attempt.
pub struct StageContext<'a> {
    pub job_id: Uuid,
    pub request: &'a Request,
    pub log: &'a ContextLog,
    /// 1 for the first attempt, 2 for the repair attempt.
    pub attempt: u32,
    pub trace: &'a dyn TraceSink,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput>;
}

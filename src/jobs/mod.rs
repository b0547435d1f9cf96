//! Job lifecycle management
//!
//! Accepts requests, spawns one orchestrator task per job, and serves
//! snapshots of job state, final results, and trace events. Submission
//! returns immediately; the wall-clock budget and cancellation are applied
//! here, around the orchestrator run.

use crate::error::OrchestrationError;
use crate::models::{
    FinalReport, JobState, JobStatus, Request, TraceEvent, TraceEventKind,
};
use crate::orchestrator::{cancel_pair, CancelHandle, Orchestrator};
use crate::state::ContextStore;
use crate::trace::{MemoryTraceSink, TraceSink};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

pub struct JobManager {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ContextStore>,
    trace: Arc<MemoryTraceSink>,
    handles: Arc<RwLock<HashMap<Uuid, CancelHandle>>>,
    job_budget: std::time::Duration,
}

impl JobManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn ContextStore>,
        trace: Arc<MemoryTraceSink>,
        job_budget: std::time::Duration,
    ) -> Self {
        Self {
            orchestrator,
            store,
            trace,
            handles: Arc::new(RwLock::new(HashMap::new())),
            job_budget,
        }
    }

    /// Accept a request and spawn its job task. Returns as soon as the job
    /// is registered; progress is observed through `snapshot`.
    pub async fn submit(&self, request: Request) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        self.store
            .put_job(JobState {
                job_id,
                status: JobStatus::Pending,
                request: request.clone(),
                final_output: None,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let (handle, token) = cancel_pair();
        self.handles.write().await.insert(job_id, handle);

        let orchestrator = self.orchestrator.clone();
        let store = self.store.clone();
        let trace = self.trace.clone();
        let handles = self.handles.clone();
        let budget = self.job_budget;

        tokio::spawn(async move {
            let _ = store.set_status(job_id, JobStatus::Running).await;

            let outcome =
                tokio::time::timeout(budget, orchestrator.run(job_id, &request, token)).await;

            let status = match outcome {
                Ok(Ok((report, log))) => {
                    let _ = store.put_log(job_id, log).await;
                    match store.get_job(job_id).await {
                        Ok(mut state) => {
                            state.status = JobStatus::Completed;
                            state.final_output = Some(report);
                            state.updated_at = Utc::now();
                            let _ = store.put_job(state).await;
                        }
                        Err(e) => error!(job_id = %job_id, error = %e, "Job vanished from store"),
                    }
                    JobStatus::Completed
                }
                Ok(Err(OrchestrationError::Cancelled)) => {
                    let _ = store.set_status(job_id, JobStatus::Cancelled).await;
                    JobStatus::Cancelled
                }
                Ok(Err(e)) => {
                    let _ = fail_job(&*store, job_id, e.to_string()).await;
                    JobStatus::Failed
                }
                Err(_) => {
                    let message =
                        OrchestrationError::Timeout(budget.as_secs()).to_string();
                    let _ = fail_job(&*store, job_id, message).await;
                    JobStatus::Failed
                }
            };

            handles.write().await.remove(&job_id);
            let kind = match status {
                JobStatus::Completed => TraceEventKind::JobCompleted,
                JobStatus::Cancelled => TraceEventKind::JobCancelled,
                _ => TraceEventKind::JobFailed,
            };
            trace.emit(job_id, TraceEvent::job(kind, format!("job {:?}", status)));
            info!(job_id = %job_id, status = ?status, "Job finished");
        });

        Ok(job_id)
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Result<JobState> {
        self.store.get_job(job_id).await
    }

    /// Final report of a completed job. Running jobs are reported as such.
    pub async fn result(&self, job_id: Uuid) -> Result<FinalReport> {
        let state = self.store.get_job(job_id).await?;
        match (state.status, state.final_output) {
            (JobStatus::Completed, Some(report)) => Ok(report),
            (JobStatus::Failed, _) => Err(OrchestrationError::Stage(
                state
                    .error
                    .unwrap_or_else(|| "job failed".to_string()),
            )),
            (JobStatus::Cancelled, _) => Err(OrchestrationError::Cancelled),
            _ => Err(OrchestrationError::State(format!(
                "job {} is still {:?}",
                job_id, state.status
            ))),
        }
    }

    /// Request cancellation. Idempotent: cancelling a finished job is a
    /// no-op that still verifies the job exists. Returns the job's current
    /// status; it flips to Cancelled only once the orchestrator observes
    /// the token.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatus> {
        let state = self.store.get_job(job_id).await?;
        if state.status.is_terminal() {
            return Ok(state.status);
        }
        if let Some(handle) = self.handles.read().await.get(&job_id) {
            handle.cancel();
        }
        Ok(self.store.get_job(job_id).await?.status)
    }

    pub fn traces(&self, job_id: Uuid) -> Vec<TraceEvent> {
        self.trace.events_for(job_id)
    }

    pub async fn list(&self) -> Result<Vec<JobState>> {
        self.store.list_jobs().await
    }
}

async fn fail_job(store: &dyn ContextStore, job_id: Uuid, message: String) -> Result<()> {
    let mut state = store.get_job(job_id).await?;
    state.status = JobStatus::Failed;
    state.error = Some(message);
    state.updated_at = Utc::now();
    store.put_job(state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::llm::{LlmClient, ScriptedLlm};
    use crate::models::{StageName, StageOutput};
    use crate::providers::testing::{article, StaticMarketProvider, StaticNewsProvider};
    use crate::providers::ProviderChain;
    use crate::sandbox::Sandbox;
    use crate::stages::{DraftStage, PlanStage, QuantStage, Stage, StageContext};
    use crate::state::InMemoryContextStore;
    use crate::validation::create_default_gate;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn manager(llm: ScriptedLlm, budget: Duration) -> JobManager {
        let chain = Arc::new(ProviderChain::new(vec![
            Arc::new(StaticMarketProvider {
                name: "feed",
                closes: (0..60).map(|i| 100.0 + i as f64 * 0.5).collect(),
            }),
            Arc::new(StaticNewsProvider {
                articles: vec![article("Apple beats estimates", "https://news/a")],
            }),
        ]));
        let trace = Arc::new(MemoryTraceSink::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(llm),
            chain,
            OrchestratorConfig::default(),
            trace.clone(),
        ));
        JobManager::new(
            orchestrator,
            Arc::new(InMemoryContextStore::new()),
            trace,
            budget,
        )
    }

    fn request() -> Request {
        let mut request = Request::from_query("How is AAPL doing?");
        request.tickers = vec!["AAPL".to_string()];
        request
    }

    async fn wait_terminal(manager: &JobManager, job_id: Uuid) -> JobState {
        for _ in 0..200 {
            let state = manager.snapshot(job_id).await.unwrap();
            if state.status.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn submitted_job_completes_with_a_report() {
        let plan = "{\"use_research\": true, \"use_quant\": true, \"symbol\": \"AAPL\"}";
        let manager = manager(ScriptedLlm::single(plan), Duration::from_secs(30));

        let job_id = manager.submit(request()).await.unwrap();
        let state = wait_terminal(&manager, job_id).await;

        assert_eq!(state.status, JobStatus::Completed);
        let report = manager.result(job_id).await.unwrap();
        assert!(report.answer.contains("not financial advice"));

        let events = manager.traces(job_id);
        assert!(events
            .iter()
            .any(|e| e.kind == TraceEventKind::JobStarted));
        assert!(events
            .iter()
            .any(|e| e.kind == TraceEventKind::VerdictIssued));
    }

    #[tokio::test]
    async fn result_of_a_running_job_is_a_state_error() {
        let plan = "{\"use_research\": true, \"use_quant\": false, \"symbol\": null}";
        let manager = manager(ScriptedLlm::single(plan), Duration::from_secs(30));
        let job_id = manager.submit(Request::from_query("markets")).await.unwrap();

        // Immediately after submit the job is pending or running.
        match manager.result(job_id).await {
            Err(OrchestrationError::State(_)) => {}
            Ok(_) => {} // already done, also acceptable
            Err(e) => panic!("unexpected error: {}", e),
        }
        wait_terminal(&manager, job_id).await;
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let plan = "{\"use_research\": true, \"use_quant\": false}";
        let manager = manager(ScriptedLlm::single(plan), Duration::from_secs(5));
        let missing = Uuid::new_v4();
        assert!(matches!(
            manager.snapshot(missing).await,
            Err(OrchestrationError::JobNotFound(_))
        ));
        assert!(matches!(
            manager.cancel(missing).await,
            Err(OrchestrationError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_job_ends_cancelled_with_a_matching_trace() {
        struct Stalling;
        #[async_trait]
        impl Stage for Stalling {
            fn name(&self) -> StageName {
                StageName::Research
            }
            async fn run(&self, _ctx: &StageContext<'_>) -> crate::Result<StageOutput> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(StageOutput::new(json!({"findings": []})))
            }
        }

        let plan = "{\"use_research\": true, \"use_quant\": false, \"symbol\": null}";
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::single(plan));
        let chain = Arc::new(ProviderChain::new(vec![Arc::new(StaticMarketProvider {
            name: "feed",
            closes: (0..60).map(|i| 100.0 + i as f64 * 0.5).collect(),
        })]));
        let trace = Arc::new(MemoryTraceSink::new());
        let orchestrator = Arc::new(Orchestrator::with_stages(
            llm.clone(),
            Arc::new(PlanStage::new(llm)),
            Arc::new(Stalling),
            Arc::new(QuantStage::new(chain, Sandbox::new(Duration::from_secs(2)), 2)),
            Arc::new(DraftStage::new()),
            create_default_gate(),
            OrchestratorConfig::default(),
            trace.clone(),
        ));
        let manager = JobManager::new(
            orchestrator,
            Arc::new(InMemoryContextStore::new()),
            trace,
            Duration::from_secs(30),
        );

        let job_id = manager.submit(Request::from_query("slow")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Cancellation is asynchronous; the returned status reflects the
        // store at request time, never a completion that did not happen.
        let requested = manager.cancel(job_id).await.unwrap();
        assert_ne!(requested, JobStatus::Completed);
        assert_ne!(requested, JobStatus::Failed);

        let state = wait_terminal(&manager, job_id).await;
        assert_eq!(state.status, JobStatus::Cancelled);

        let events = manager.traces(job_id);
        assert!(events
            .iter()
            .any(|e| e.kind == TraceEventKind::JobCancelled));
        assert!(!events.iter().any(|e| e.kind == TraceEventKind::JobFailed));
    }

    #[tokio::test]
    async fn cancelling_a_finished_job_is_a_no_op() {
        let plan = "{\"use_research\": true, \"use_quant\": true, \"symbol\": \"AAPL\"}";
        let manager = manager(ScriptedLlm::single(plan), Duration::from_secs(30));
        let job_id = manager.submit(request()).await.unwrap();
        let state = wait_terminal(&manager, job_id).await;
        assert_eq!(state.status, JobStatus::Completed);

        let status = manager.cancel(job_id).await.unwrap();
        assert_eq!(status, JobStatus::Completed);
    }
}

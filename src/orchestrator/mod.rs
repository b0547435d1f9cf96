//! Stage orchestrator and repair loop
//!
//! Owns the context log for the lifetime of a job: stages and checkers only
//! ever see `&ContextLog`, and every entry is appended here with its
//! integrity hash. The pipeline is a fixed sequence with audit checkpoints
//! after each data-producing stage; a REJECTED verdict buys exactly one
//! repair attempt per named stage before the module is marked failed.

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::integrity::entry_hash;
use crate::llm::LlmClient;
use crate::models::{
    AuditRecord, ContextEntry, ContextLog, EntryStatus, FinalReport, Request, StageName,
    StageOutput, TraceEvent, TraceEventKind, TracedNumber, VerdictStatus,
};
use crate::providers::ProviderChain;
use crate::sandbox::Sandbox;
use crate::stages::{DraftStage, PlanPayload, PlanStage, QuantStage, ResearchStage, Stage, StageContext};
use crate::trace::TraceSink;
use crate::validation::{create_default_gate, ValidationGate};
use crate::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

//
// ================= Cancellation =================
//

/// Caller-side handle that cancels a running job.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Token checked by the orchestrator at every suspension point.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling; never resolve.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

//
// ================= Orchestrator =================
//

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    plan: Arc<dyn Stage>,
    research: Arc<dyn Stage>,
    quant: Arc<dyn Stage>,
    draft: Arc<dyn Stage>,
    gate: ValidationGate,
    config: OrchestratorConfig,
    trace: Arc<dyn TraceSink>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        chain: Arc<ProviderChain>,
        config: OrchestratorConfig,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        let sandbox = Sandbox::new(config.sandbox_timeout);
        Self {
            plan: Arc::new(PlanStage::new(llm.clone())),
            research: Arc::new(ResearchStage::new(chain.clone())),
            quant: Arc::new(QuantStage::new(chain, sandbox, config.sandbox_retry_cap)),
            draft: Arc::new(DraftStage::new()),
            gate: create_default_gate(),
            llm,
            config,
            trace,
        }
    }

    /// Construction with explicit collaborators, used by tests.
    #[allow(clippy::too_many_arguments)]
    pub fn with_stages(
        llm: Arc<dyn LlmClient>,
        plan: Arc<dyn Stage>,
        research: Arc<dyn Stage>,
        quant: Arc<dyn Stage>,
        draft: Arc<dyn Stage>,
        gate: ValidationGate,
        config: OrchestratorConfig,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            llm,
            plan,
            research,
            quant,
            draft,
            gate,
            config,
            trace,
        }
    }

    /// Run one job to completion. The returned log contains every stage
    /// attempt, audit verdict, and the final report entry.
    pub async fn run(
        &self,
        job_id: Uuid,
        request: &Request,
        mut cancel: CancelToken,
    ) -> Result<(FinalReport, ContextLog)> {
        if !self.llm.configured() {
            return Err(OrchestrationError::FatalConfig(
                "no LLM backend configured; set GEMINI_API_KEY".to_string(),
            ));
        }

        self.trace.emit(
            job_id,
            TraceEvent::job(TraceEventKind::JobStarted, request.query.clone()),
        );

        let mut log = ContextLog::new();
        let mut extra_limitations: Vec<String> = Vec::new();

        // Plan is mandatory; a planning failure fails the job.
        self.execute_stage(&*self.plan, job_id, request, &mut log, 1, &mut cancel)
            .await?;

        let module_plan = log
            .latest_success(StageName::Plan)
            .and_then(|e| serde_json::from_value::<PlanPayload>(e.payload.clone()).ok())
            .map(|p| p.modules)
            .ok_or_else(|| OrchestrationError::Planning("plan payload unreadable".to_string()))?;

        if module_plan.use_research {
            self.run_audited_module(&*self.research, job_id, request, &mut log, &mut cancel, &mut extra_limitations)
                .await?;
        } else {
            self.append_skipped(&mut log, StageName::Research, "module not selected by plan");
        }

        if module_plan.use_quant {
            self.run_audited_module(&*self.quant, job_id, request, &mut log, &mut cancel, &mut extra_limitations)
                .await?;
        } else {
            self.append_skipped(&mut log, StageName::Quant, "module not selected by plan");
        }

        self.run_audited_module(&*self.draft, job_id, request, &mut log, &mut cancel, &mut extra_limitations)
            .await?;

        let report = self.synthesize_report(&log, &extra_limitations);
        self.append_entry(
            &mut log,
            StageName::Final,
            1,
            EntryStatus::Success,
            StageOutput::new(serde_json::to_value(&report)?),
        );

        self.trace.emit(
            job_id,
            TraceEvent::job(
                TraceEventKind::JobCompleted,
                format!("audit status {}", report.audit_status),
            ),
        );
        Ok((report, log))
    }

    /// Run a stage, audit its output, and apply the bounded repair loop on
    /// rejection. Repair re-invokes exactly the stages the verdict names,
    /// once each; a second rejection marks the module failed.
    async fn run_audited_module(
        &self,
        stage: &dyn Stage,
        job_id: Uuid,
        request: &Request,
        log: &mut ContextLog,
        cancel: &mut CancelToken,
        extra_limitations: &mut Vec<String>,
    ) -> Result<()> {
        let target = stage.name();
        let Some(output) = self
            .execute_stage(stage, job_id, request, log, 1, cancel)
            .await?
        else {
            extra_limitations.push(format!("{} stage failed and was excluded", target));
            return Ok(());
        };

        let verdict = self.gate.validate(target, &output, log);
        let status = verdict.status;
        let reruns = verdict.required_reruns.clone();
        let mut open_problems: Vec<String> =
            verdict.issues.iter().map(|i| i.problem.clone()).collect();
        self.append_audit(log, job_id, target, 1, verdict);

        if status != VerdictStatus::Rejected {
            return Ok(());
        }

        // Bounded repair over the stages the verdict named.
        for pass in 0..self.config.repair_cap {
            let attempt = pass + 2;
            for rerun in &reruns {
                let Some(rerun_stage) = self.stage_for(*rerun) else {
                    warn!(stage = %rerun, "Verdict named a stage with no executor");
                    continue;
                };
                self.execute_stage(rerun_stage, job_id, request, log, attempt, cancel)
                    .await?;
            }

            // Only a successful rerun is re-audited. An errored rerun left
            // a Failed entry; auditing its error payload could pair an
            // approving verdict with the rejected earlier attempt.
            let Some(repaired) = log
                .latest(target)
                .filter(|e| e.attempt == attempt && e.status == EntryStatus::Success)
                .map(|e| StageOutput {
                    payload: e.payload.clone(),
                    limitations: e.limitations.clone(),
                })
            else {
                break;
            };
            let verdict = self.gate.validate(target, &repaired, log);
            let repaired_status = verdict.status;
            open_problems = verdict.issues.iter().map(|i| i.problem.clone()).collect();
            self.append_audit(log, job_id, target, attempt, verdict);

            if repaired_status != VerdictStatus::Rejected {
                return Ok(());
            }
        }

        warn!(stage = %target, "Module failed validation after repair");
        extra_limitations.push(format!(
            "{} failed validation after repair; its findings were excluded",
            target
        ));
        for problem in open_problems {
            let message = format!("{}: {}", target, problem);
            if !extra_limitations.contains(&message) {
                extra_limitations.push(message);
            }
        }
        Ok(())
    }

    /// Execute one stage attempt and append the resulting entry. Returns
    /// `None` when the stage erred (recorded as a Failed entry); hard errors
    /// (cancellation) propagate.
    async fn execute_stage(
        &self,
        stage: &dyn Stage,
        job_id: Uuid,
        request: &Request,
        log: &mut ContextLog,
        attempt: u32,
        cancel: &mut CancelToken,
    ) -> Result<Option<StageOutput>> {
        let name = stage.name();
        self.trace.emit(
            job_id,
            TraceEvent::stage(
                TraceEventKind::StageStarted,
                name,
                format!("attempt {}", attempt),
            ),
        );

        let result = {
            let ctx = StageContext {
                job_id,
                request,
                log,
                attempt,
                trace: &*self.trace,
            };
            tokio::select! {
                result = stage.run(&ctx) => result,
                _ = cancel.cancelled() => {
                    info!(stage = %name, "Cancelled mid-stage; no entry appended");
                    return Err(OrchestrationError::Cancelled);
                }
            }
        };

        match result {
            Ok(output) => {
                self.append_entry(log, name, attempt, EntryStatus::Success, output.clone());
                self.trace.emit(
                    job_id,
                    TraceEvent::stage(TraceEventKind::StageCompleted, name, "ok"),
                );
                Ok(Some(output))
            }
            Err(OrchestrationError::Cancelled) => Err(OrchestrationError::Cancelled),
            Err(e) if name == StageName::Plan => Err(e),
            Err(e) => {
                warn!(stage = %name, error = %e, "Stage failed; recorded and excluded");
                self.append_entry(
                    log,
                    name,
                    attempt,
                    EntryStatus::Failed,
                    StageOutput::with_limitations(
                        json!({ "error": e.to_string() }),
                        vec![format!("{} stage failed: {}", name, e)],
                    ),
                );
                self.trace.emit(
                    job_id,
                    TraceEvent::stage(TraceEventKind::StageFailed, name, e.to_string()),
                );
                Ok(None)
            }
        }
    }

    fn stage_for(&self, name: StageName) -> Option<&dyn Stage> {
        match name {
            StageName::Plan => Some(&*self.plan),
            StageName::Research => Some(&*self.research),
            StageName::Quant => Some(&*self.quant),
            StageName::Draft => Some(&*self.draft),
            StageName::Audit | StageName::Final => None,
        }
    }

    fn append_entry(
        &self,
        log: &mut ContextLog,
        stage: StageName,
        attempt: u32,
        status: EntryStatus,
        output: StageOutput,
    ) {
        let integrity_hash = entry_hash(stage, attempt, status, &output.payload);
        log.append(ContextEntry {
            entry_id: Uuid::new_v4(),
            stage,
            attempt,
            status,
            payload: output.payload,
            limitations: output.limitations,
            created_at: Utc::now(),
            integrity_hash,
        });
    }

    fn append_skipped(&self, log: &mut ContextLog, stage: StageName, reason: &str) {
        info!(stage = %stage, reason, "Stage skipped");
        self.append_entry(
            log,
            stage,
            1,
            EntryStatus::Skipped,
            StageOutput::new(json!({ "reason": reason })),
        );
    }

    fn append_audit(
        &self,
        log: &mut ContextLog,
        job_id: Uuid,
        target: StageName,
        target_attempt: u32,
        verdict: crate::models::ValidationVerdict,
    ) {
        self.trace.emit(
            job_id,
            TraceEvent::stage(
                TraceEventKind::VerdictIssued,
                StageName::Audit,
                format!("{} for {} attempt {}", verdict.status, target, target_attempt),
            ),
        );
        // A PARTIAL verdict advances the pipeline, so its issues must be
        // on the record as limitations; a rejection is either repaired or
        // surfaced by the repair loop instead.
        let limitations: Vec<String> = if verdict.status == VerdictStatus::Partial {
            verdict
                .issues
                .iter()
                .map(|i| format!("{}: {}", target, i.problem))
                .collect()
        } else {
            Vec::new()
        };
        let record = AuditRecord {
            target,
            target_attempt,
            verdict,
        };
        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => json!({ "error": format!("verdict serialization failed: {}", e) }),
        };
        self.append_entry(
            log,
            StageName::Audit,
            target_attempt,
            EntryStatus::Success,
            StageOutput::with_limitations(payload, limitations),
        );
    }

    /// Terminal synthesis from audited material only. A rejected draft
    /// degrades to a minimal answer that names what is missing.
    fn synthesize_report(&self, log: &ContextLog, extra_limitations: &[String]) -> FinalReport {
        let audit_status = log
            .latest_verdict(StageName::Draft)
            .map(|(_, v)| v.status)
            .unwrap_or(VerdictStatus::Rejected);

        let mut limitations = log.all_limitations();
        for limitation in extra_limitations {
            if !limitations.contains(limitation) {
                limitations.push(limitation.clone());
            }
        }

        let Some(draft) = log.approved_payload(StageName::Draft) else {
            let mut answer = String::from(
                "The requested analysis could not be completed to audit standards.\n",
            );
            if !limitations.is_empty() {
                answer.push_str("\nKnown limitations:\n");
                for limitation in &limitations {
                    answer.push_str(&format!("- {}\n", limitation));
                }
            }
            answer.push_str("\n*This is automated research output, not financial advice.*\n");
            return FinalReport {
                answer,
                limitations,
                audit_status,
                sources: Vec::new(),
                numbers: Vec::new(),
            };
        };

        let answer = draft
            .get("answer")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let numbers: Vec<TracedNumber> = draft
            .get("numbers")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let sources: Vec<String> = draft
            .get("sources")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        FinalReport {
            answer,
            limitations,
            audit_status,
            sources,
            numbers,
        }
    }
}

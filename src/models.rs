//! Core data models for the finance insight orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Plan,
    Research,
    Quant,
    Audit,
    Draft,
    Final,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    Approved,
    Partial,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

//
// ================= Request =================
//

/// A user research request. Immutable once accepted by the job manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub query: String,
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_outputsize")]
    pub outputsize: u32,
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_max_articles")]
    pub max_articles: u32,
    #[serde(default)]
    pub sources_requested: bool,
}

fn default_interval() -> String {
    "1day".to_string()
}

fn default_outputsize() -> u32 {
    260
}

fn default_horizon_days() -> u32 {
    30
}

fn default_days() -> u32 {
    7
}

fn default_max_articles() -> u32 {
    8
}

impl Request {
    pub fn from_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tickers: Vec::new(),
            sites: Vec::new(),
            interval: default_interval(),
            outputsize: default_outputsize(),
            horizon_days: default_horizon_days(),
            days: default_days(),
            max_articles: default_max_articles(),
            sources_requested: false,
        }
    }

    /// Primary symbol for quantitative analysis, if any was hinted.
    pub fn primary_symbol(&self) -> Option<&str> {
        self.tickers
            .iter()
            .map(|t| t.trim())
            .find(|t| !t.is_empty())
    }
}

//
// ================= Context Log =================
//

/// One finalized stage attempt. Entries are append-only: once written they
/// are never edited or removed, and repair attempts append new entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub entry_id: Uuid,
    pub stage: StageName,
    pub attempt: u32,
    pub status: EntryStatus,
    pub payload: Value,
    pub limitations: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// SHA-256 over (stage, attempt, status, payload), computed at append.
    pub integrity_hash: String,
}

/// Append-only ordered record of stage attempts and verdicts for one job.
///
/// The orchestrator is the single writer; every other component only ever
/// sees `&ContextLog`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextLog {
    entries: Vec<ContextEntry>,
}

impl ContextLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a finalized entry. Only the orchestrator calls this.
    pub(crate) fn append(&mut self, entry: ContextEntry) {
        self.entries.push(entry);
    }

    /// Latest attempt entry for a stage, regardless of status.
    pub fn latest(&self, stage: StageName) -> Option<&ContextEntry> {
        self.entries.iter().rev().find(|e| e.stage == stage)
    }

    /// Latest successful attempt entry for a stage.
    pub fn latest_success(&self, stage: StageName) -> Option<&ContextEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.stage == stage && e.status == EntryStatus::Success)
    }

    /// Latest audit verdict issued against `target`, with its entry.
    pub fn latest_verdict(&self, target: StageName) -> Option<(&ContextEntry, ValidationVerdict)> {
        self.entries.iter().rev().find_map(|e| {
            if e.stage != StageName::Audit {
                return None;
            }
            let record: AuditRecord = serde_json::from_value(e.payload.clone()).ok()?;
            if record.target == target {
                Some((e, record.verdict))
            } else {
                None
            }
        })
    }

    /// Data usable for synthesis from a stage: the full payload when the
    /// latest verdict is APPROVED, the approved subset when PARTIAL, and
    /// nothing when REJECTED or never audited.
    pub fn approved_payload(&self, stage: StageName) -> Option<Value> {
        let (_, verdict) = self.latest_verdict(stage)?;
        match verdict.status {
            VerdictStatus::Approved => self.latest_success(stage).map(|e| e.payload.clone()),
            VerdictStatus::Partial => verdict.approved_subset,
            VerdictStatus::Rejected => None,
        }
    }

    /// All limitations recorded across the log, deduplicated, in order.
    pub fn all_limitations(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in &self.entries {
            for limitation in &entry.limitations {
                if !out.contains(limitation) {
                    out.push(limitation.clone());
                }
            }
        }
        out
    }
}

//
// ================= Stage Output =================
//

/// Output of one stage attempt: a structured payload plus the stage's
/// self-reported limitations. A stage must never fabricate a number; every
/// numeric value in `payload` traces to a provider result or a sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: Value,
    #[serde(default)]
    pub limitations: Vec<String>,
}

impl StageOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            limitations: Vec::new(),
        }
    }

    pub fn with_limitations(payload: Value, limitations: Vec<String>) -> Self {
        Self {
            payload,
            limitations,
        }
    }
}

//
// ================= Validation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Range,
    Completeness,
    CrossSource,
    Policy,
    Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictIssue {
    pub category: IssueCategory,
    pub problem: String,
    pub fix_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub checker: String,
    pub passed: bool,
    pub blocking: bool,
    pub detail: String,
}

/// The validation gate's classification of one stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub status: VerdictStatus,
    pub issues: Vec<VerdictIssue>,
    pub approved_subset: Option<Value>,
    pub required_reruns: Vec<StageName>,
    pub checks: Vec<CheckOutcome>,
    pub issued_at: DateTime<Utc>,
}

/// Payload shape of an Audit context entry: which stage attempt was audited
/// and what the gate decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub target: StageName,
    pub target_attempt: u32,
    pub verdict: ValidationVerdict,
}

//
// ================= Provider Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvSeries {
    pub symbol: String,
    pub interval: String,
    pub bars: Vec<OhlcvBar>,
}

impl OhlcvSeries {
    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalsData {
    pub symbol: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub market_cap: Option<f64>,
    pub dividend_yield: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub headline: String,
    pub url: String,
    pub snippet: String,
    pub source: String,
    pub published_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataPayload {
    Series(OhlcvSeries),
    Fundamentals(FundamentalsData),
    Articles(Vec<Article>),
}

/// Result of one provider-chain traversal. Never silently empty: either
/// `provider` + `payload` are set, or `error` explains why data is
/// unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider: Option<String>,
    pub payload: Option<DataPayload>,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ProviderResult {
    pub fn is_available(&self) -> bool {
        self.provider.is_some() && self.payload.is_some()
    }
}

//
// ================= Final Report =================
//

/// One numeric claim in a final report, tagged with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedNumber {
    pub label: String,
    pub value: f64,
    /// "provider:<name>" or "sandbox".
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub answer: String,
    pub limitations: Vec<String>,
    pub audit_status: VerdictStatus,
    pub sources: Vec<String>,
    pub numbers: Vec<TracedNumber>,
}

//
// ================= Job State =================
//

/// Read-only snapshot of a job. The live state is owned exclusively by the
/// orchestrator task for the job's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub request: Request,
    pub final_output: Option<FinalReport>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//
// ================= Trace Events =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    JobStarted,
    StageStarted,
    StageCompleted,
    StageFailed,
    ToolStarted,
    ToolCompleted,
    ToolFailed,
    VerdictIssued,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub stage: Option<StageName>,
    pub tool: Option<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl TraceEvent {
    pub fn stage(kind: TraceEventKind, stage: StageName, summary: impl Into<String>) -> Self {
        Self {
            kind,
            stage: Some(stage),
            tool: None,
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }

    pub fn tool(
        kind: TraceEventKind,
        stage: StageName,
        tool: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            stage: Some(stage),
            tool: Some(tool.into()),
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }

    pub fn job(kind: TraceEventKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            tool: None,
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageName::Plan => "plan",
            StageName::Research => "research",
            StageName::Quant => "quant",
            StageName::Audit => "audit",
            StageName::Draft => "draft",
            StageName::Final => "final",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictStatus::Approved => "APPROVED",
            VerdictStatus::Partial => "PARTIAL",
            VerdictStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

//! Validation gate for stage outputs
//!
//! Deterministic checks run between stages. The gate classifies an output
//! as APPROVED, PARTIAL (with an approved subset), or REJECTED (with the
//! stages that must re-run); it never mutates the output it inspects.

use crate::models::{
    CheckOutcome, ContextLog, IssueCategory, StageName, StageOutput, ValidationVerdict,
    VerdictIssue, VerdictStatus,
};
use chrono::Utc;
use serde_json::Value;
use tracing::info;

/// Relative disagreement between independent sources above which a value
/// is considered contested.
const CROSS_SOURCE_TOLERANCE: f64 = 0.02;

pub struct CheckResult {
    pub passed: bool,
    pub detail: String,
    pub issues: Vec<VerdictIssue>,
    /// Payload subset that survives even though the check failed.
    pub approved_subset: Option<Value>,
    pub required_reruns: Vec<StageName>,
}

impl CheckResult {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
            issues: Vec::new(),
            approved_subset: None,
            required_reruns: Vec::new(),
        }
    }

    pub fn fail(issue: VerdictIssue, reruns: Vec<StageName>) -> Self {
        Self {
            passed: false,
            detail: issue.problem.clone(),
            issues: vec![issue],
            approved_subset: None,
            required_reruns: reruns,
        }
    }

    pub fn with_subset(mut self, subset: Value) -> Self {
        self.approved_subset = Some(subset);
        self
    }
}

/// One deterministic check applied to a stage output.
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a failure of this check blocks the output outright.
    fn blocking(&self) -> bool;

    fn check(&self, stage: StageName, output: &StageOutput, log: &ContextLog) -> CheckResult;
}

pub struct ValidationGate {
    checkers: Vec<Box<dyn Checker>>,
}

impl ValidationGate {
    pub fn new() -> Self {
        Self {
            checkers: Vec::new(),
        }
    }

    pub fn add_checker(&mut self, checker: Box<dyn Checker>) {
        self.checkers.push(checker);
    }

    /// Run every checker against the output and fold the results into a
    /// single verdict. Pure classification: identical input yields an
    /// identical verdict (modulo timestamp).
    pub fn validate(
        &self,
        stage: StageName,
        output: &StageOutput,
        log: &ContextLog,
    ) -> ValidationVerdict {
        let mut checks = Vec::with_capacity(self.checkers.len());
        let mut issues = Vec::new();
        let mut required_reruns: Vec<StageName> = Vec::new();
        let mut blocking_subset = None;
        let mut advisory_subset = None;
        let mut blocking_failure = false;

        for checker in &self.checkers {
            let result = checker.check(stage, output, log);

            checks.push(CheckOutcome {
                checker: checker.name().to_string(),
                passed: result.passed,
                blocking: checker.blocking(),
                detail: result.detail,
            });

            if !result.passed {
                if checker.blocking() {
                    blocking_failure = true;
                    if blocking_subset.is_none() {
                        blocking_subset = result.approved_subset;
                    }
                } else if advisory_subset.is_none() {
                    advisory_subset = result.approved_subset;
                }
                issues.extend(result.issues);
                for rerun in result.required_reruns {
                    if !required_reruns.contains(&rerun) {
                        required_reruns.push(rerun);
                    }
                }
            }
        }

        // Only a subset produced by the failing blocking check itself can
        // downgrade a blocking failure; a non-blocking check's subset never
        // stands in for one.
        let status = if issues.is_empty() {
            VerdictStatus::Approved
        } else if blocking_failure && blocking_subset.is_none() {
            VerdictStatus::Rejected
        } else {
            VerdictStatus::Partial
        };
        let approved_subset = if status == VerdictStatus::Partial {
            blocking_subset.or(advisory_subset)
        } else {
            None
        };

        info!(
            stage = %stage,
            status = %status,
            checker_count = self.checkers.len(),
            issue_count = issues.len(),
            "Validation completed"
        );

        ValidationVerdict {
            status,
            issues,
            approved_subset,
            required_reruns: if status == VerdictStatus::Rejected {
                required_reruns
            } else {
                Vec::new()
            },
            checks,
            issued_at: Utc::now(),
        }
    }
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Gate with the standard checkers installed.
pub fn create_default_gate() -> ValidationGate {
    let mut gate = ValidationGate::new();
    gate.add_checker(Box::new(RangeSanityChecker));
    gate.add_checker(Box::new(CompletenessChecker));
    gate.add_checker(Box::new(CrossSourceChecker));
    gate.add_checker(Box::new(PolicyChecker));
    gate.add_checker(Box::new(ProvenanceChecker));
    gate
}

//
// ================= Checkers =================
//

/// Numeric sanity: RSI bounded to [0, 100], prices and volatility positive.
pub struct RangeSanityChecker;

impl Checker for RangeSanityChecker {
    fn name(&self) -> &'static str {
        "range_sanity"
    }

    fn blocking(&self) -> bool {
        true
    }

    fn check(&self, stage: StageName, output: &StageOutput, _log: &ContextLog) -> CheckResult {
        if stage != StageName::Quant {
            return CheckResult::pass("not applicable");
        }
        let metrics = match output.payload.get("metrics") {
            Some(Value::Object(m)) => m,
            _ => return CheckResult::pass("no metrics present"),
        };

        let mut violations = Vec::new();
        if let Some(rsi) = metric_value(metrics.get("rsi_14")) {
            if !(0.0..=100.0).contains(&rsi) {
                violations.push(format!("rsi_14 {} outside [0, 100]", rsi));
            }
        }
        for key in ["last_close", "sma_20"] {
            if let Some(v) = metric_value(metrics.get(key)) {
                if v <= 0.0 {
                    violations.push(format!("{} {} not positive", key, v));
                }
            }
        }
        if let Some(vol) = metric_value(metrics.get("annualized_vol_pct")) {
            if vol < 0.0 {
                violations.push(format!("annualized_vol_pct {} negative", vol));
            }
        }

        if violations.is_empty() {
            CheckResult::pass("metric ranges sane")
        } else {
            CheckResult::fail(
                VerdictIssue {
                    category: IssueCategory::Range,
                    problem: violations.join("; "),
                    fix_action: "recompute the out-of-range metrics".to_string(),
                },
                vec![StageName::Quant],
            )
        }
    }
}

/// Every research finding must cite a url and a publication date; quant
/// payloads must carry their required fields.
pub struct CompletenessChecker;

impl Checker for CompletenessChecker {
    fn name(&self) -> &'static str {
        "completeness"
    }

    fn blocking(&self) -> bool {
        true
    }

    fn check(&self, stage: StageName, output: &StageOutput, _log: &ContextLog) -> CheckResult {
        match stage {
            StageName::Research => {
                let Some(findings) = output.payload.get("findings").and_then(Value::as_array)
                else {
                    return CheckResult::pass("no findings present");
                };

                let (cited, uncited): (Vec<&Value>, Vec<&Value>) =
                    findings.iter().partition(|f| {
                        has_nonempty_str(f, "url") && has_nonempty_str(f, "published_at")
                    });

                if uncited.is_empty() {
                    return CheckResult::pass(format!("{} findings fully cited", cited.len()));
                }
                if cited.is_empty() {
                    return CheckResult::fail(
                        VerdictIssue {
                            category: IssueCategory::Completeness,
                            problem: "no finding carries both url and published_at".to_string(),
                            fix_action: "re-run research with citation fields".to_string(),
                        },
                        vec![StageName::Research],
                    );
                }

                // Some findings are usable: approve the cited subset.
                let mut subset = output.payload.clone();
                if let Some(obj) = subset.as_object_mut() {
                    obj.insert(
                        "findings".to_string(),
                        Value::Array(cited.into_iter().cloned().collect()),
                    );
                }
                CheckResult::fail(
                    VerdictIssue {
                        category: IssueCategory::Completeness,
                        problem: format!("{} findings lack url or published_at", uncited.len()),
                        fix_action: "drop uncited findings".to_string(),
                    },
                    vec![StageName::Research],
                )
                .with_subset(subset)
            }
            StageName::Quant => {
                let has_metrics = output
                    .payload
                    .get("metrics")
                    .map(|m| m.is_object())
                    .unwrap_or(false);
                let degraded = !output.limitations.is_empty()
                    || output.payload.get("skipped").is_some();
                if has_metrics || degraded {
                    CheckResult::pass("quant payload complete or explicitly degraded")
                } else {
                    CheckResult::fail(
                        VerdictIssue {
                            category: IssueCategory::Completeness,
                            problem: "quant payload missing metrics without a stated limitation"
                                .to_string(),
                            fix_action: "re-run quant".to_string(),
                        },
                        vec![StageName::Quant],
                    )
                }
            }
            _ => CheckResult::pass("not applicable"),
        }
    }
}

/// Flags material disagreement between independent values reported for the
/// same fact (above 2% relative difference).
pub struct CrossSourceChecker;

impl Checker for CrossSourceChecker {
    fn name(&self) -> &'static str {
        "cross_source"
    }

    fn blocking(&self) -> bool {
        false
    }

    fn check(&self, stage: StageName, output: &StageOutput, _log: &ContextLog) -> CheckResult {
        if stage != StageName::Quant {
            return CheckResult::pass("not applicable");
        }
        let Some(claims) = output.payload.get("cross_source").and_then(Value::as_array) else {
            return CheckResult::pass("single-source values only");
        };

        let mut contested = Vec::new();
        let mut contested_labels = Vec::new();
        for claim in claims {
            let label = claim
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("value");
            let (Some(a), Some(b)) = (
                claim.get("primary").and_then(Value::as_f64),
                claim.get("secondary").and_then(Value::as_f64),
            ) else {
                continue;
            };
            let base = a.abs().max(f64::EPSILON);
            if ((a - b).abs() / base) > CROSS_SOURCE_TOLERANCE {
                contested.push(format!("{}: {} vs {}", label, a, b));
                contested_labels.push(label.to_string());
            }
        }

        if contested.is_empty() {
            CheckResult::pass("independent sources agree")
        } else {
            // The subset drops the contested metrics; agreeing values
            // carry forward.
            let mut subset = output.payload.clone();
            if let Some(metrics) = subset.get_mut("metrics").and_then(Value::as_object_mut) {
                for label in &contested_labels {
                    metrics.remove(label);
                }
            }
            CheckResult::fail(
                VerdictIssue {
                    category: IssueCategory::CrossSource,
                    problem: format!("sources disagree on: {}", contested.join("; ")),
                    fix_action: "surface the disagreement as a limitation".to_string(),
                },
                Vec::new(),
            )
            .with_subset(subset)
        }
    }
}

const PROMISSORY_PHRASES: &[&str] = &[
    "guaranteed return",
    "guaranteed profit",
    "cannot lose",
    "risk-free profit",
    "will definitely",
    "certain to rise",
    "certain to fall",
];

const ADVICE_PHRASES: &[&str] = &[
    "you should buy",
    "you should sell",
    "i recommend buying",
    "i recommend selling",
];

/// Rejects promissory or personalized-advice phrasing; drafts must carry
/// the research disclaimer.
pub struct PolicyChecker;

impl Checker for PolicyChecker {
    fn name(&self) -> &'static str {
        "policy"
    }

    fn blocking(&self) -> bool {
        true
    }

    fn check(&self, stage: StageName, output: &StageOutput, _log: &ContextLog) -> CheckResult {
        if stage != StageName::Draft {
            return CheckResult::pass("not applicable");
        }
        let Some(answer) = output.payload.get("answer").and_then(Value::as_str) else {
            return CheckResult::fail(
                VerdictIssue {
                    category: IssueCategory::Policy,
                    problem: "draft has no answer text".to_string(),
                    fix_action: "re-run draft".to_string(),
                },
                vec![StageName::Draft],
            );
        };
        let lowered = answer.to_lowercase();

        let mut problems = Vec::new();
        for phrase in PROMISSORY_PHRASES {
            if lowered.contains(phrase) {
                problems.push(format!("promissory phrasing: '{}'", phrase));
            }
        }
        for phrase in ADVICE_PHRASES {
            if lowered.contains(phrase) {
                problems.push(format!("personalized advice: '{}'", phrase));
            }
        }
        if !lowered.contains("not financial advice") {
            problems.push("missing research disclaimer".to_string());
        }

        if problems.is_empty() {
            CheckResult::pass("policy clean")
        } else {
            CheckResult::fail(
                VerdictIssue {
                    category: IssueCategory::Policy,
                    problem: problems.join("; "),
                    fix_action: "rewrite the draft without prohibited phrasing".to_string(),
                },
                vec![StageName::Draft],
            )
        }
    }
}

/// Every number a draft claims must trace to a value recorded earlier in
/// the context log.
pub struct ProvenanceChecker;

impl Checker for ProvenanceChecker {
    fn name(&self) -> &'static str {
        "provenance"
    }

    fn blocking(&self) -> bool {
        true
    }

    fn check(&self, stage: StageName, output: &StageOutput, log: &ContextLog) -> CheckResult {
        if stage != StageName::Draft {
            return CheckResult::pass("not applicable");
        }
        let Some(numbers) = output.payload.get("numbers").and_then(Value::as_array) else {
            return CheckResult::pass("draft claims no numbers");
        };

        let known = collect_log_numbers(log);
        let mut orphans = Vec::new();
        for number in numbers {
            let Some(value) = number.get("value").and_then(Value::as_f64) else {
                continue;
            };
            let label = number
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("number");
            let traced = known.iter().any(|k| (k - value).abs() < 1e-9);
            if !traced {
                orphans.push(format!("{} = {}", label, value));
            }
        }

        if orphans.is_empty() {
            CheckResult::pass(format!("{} numbers traced", numbers.len()))
        } else {
            CheckResult::fail(
                VerdictIssue {
                    category: IssueCategory::Provenance,
                    problem: format!("numbers without provenance: {}", orphans.join("; ")),
                    fix_action: "re-run draft using only recorded values".to_string(),
                },
                vec![StageName::Draft],
            )
        }
    }
}

//
// ================= Helpers =================
//

fn metric_value(metric: Option<&Value>) -> Option<f64> {
    let metric = metric?;
    metric
        .get("value")
        .and_then(Value::as_f64)
        .or_else(|| metric.as_f64())
}

fn has_nonempty_str(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Numeric values recorded in data-producing stage payloads. Draft and
/// Final entries are excluded so a draft cannot vouch for its own numbers.
fn collect_log_numbers(log: &ContextLog) -> Vec<f64> {
    let mut out = Vec::new();
    for entry in log.entries() {
        if matches!(entry.stage, StageName::Draft | StageName::Final) {
            continue;
        }
        collect_numbers(&entry.payload, &mut out);
    }
    out
}

fn collect_numbers(value: &Value, out: &mut Vec<f64>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.push(f);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_numbers(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_numbers(item, out);
            }
        }
        _ => {}
    }
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::entry_hash;
    use crate::models::{ContextEntry, EntryStatus};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn entry(stage: StageName, payload: Value) -> ContextEntry {
        let hash = entry_hash(stage, 1, EntryStatus::Success, &payload);
        ContextEntry {
            entry_id: Uuid::new_v4(),
            stage,
            attempt: 1,
            status: EntryStatus::Success,
            payload,
            limitations: Vec::new(),
            created_at: Utc::now(),
            integrity_hash: hash,
        }
    }

    fn log_with(stage: StageName, payload: Value) -> ContextLog {
        let mut log = ContextLog::new();
        log.append(entry(stage, payload));
        log
    }

    #[test]
    fn clean_quant_output_is_approved() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "metrics": {
                "last_close": {"value": 182.5, "source": "provider:stooq"},
                "rsi_14": {"value": 55.2, "source": "sandbox"},
                "annualized_vol_pct": {"value": 22.1, "source": "sandbox"}
            }
        }));
        let verdict = gate.validate(StageName::Quant, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Approved);
        assert!(verdict.required_reruns.is_empty());
    }

    #[test]
    fn out_of_range_rsi_is_rejected_with_quant_rerun() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "metrics": {"rsi_14": {"value": 140.0, "source": "sandbox"}}
        }));
        let verdict = gate.validate(StageName::Quant, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Rejected);
        assert_eq!(verdict.required_reruns, vec![StageName::Quant]);
        assert!(verdict
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::Range));
    }

    #[test]
    fn partially_cited_research_yields_partial_with_subset() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "findings": [
                {"headline": "cited", "url": "https://a", "published_at": "2024-05-01"},
                {"headline": "orphan"}
            ]
        }));
        let verdict = gate.validate(StageName::Research, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Partial);
        let subset = verdict.approved_subset.unwrap();
        assert_eq!(subset["findings"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn fully_uncited_research_is_rejected() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "findings": [{"headline": "orphan"}, {"headline": "orphan2"}]
        }));
        let verdict = gate.validate(StageName::Research, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Rejected);
        assert_eq!(verdict.required_reruns, vec![StageName::Research]);
    }

    #[test]
    fn promissory_draft_is_rejected() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "answer": "This is a guaranteed return. Not financial advice.",
            "numbers": []
        }));
        let verdict = gate.validate(StageName::Draft, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Rejected);
        assert!(verdict
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::Policy));
    }

    #[test]
    fn draft_without_disclaimer_is_rejected() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({"answer": "AAPL closed at 182.5.", "numbers": []}));
        let verdict = gate.validate(StageName::Draft, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Rejected);
    }

    #[test]
    fn untraced_number_in_draft_is_rejected() {
        let gate = create_default_gate();
        let log = log_with(
            StageName::Quant,
            json!({"metrics": {"last_close": {"value": 182.5}}}),
        );
        let output = StageOutput::new(json!({
            "answer": "The close was 999.9. Not financial advice.",
            "numbers": [{"label": "last_close", "value": 999.9}]
        }));
        let verdict = gate.validate(StageName::Draft, &output, &log);
        assert_eq!(verdict.status, VerdictStatus::Rejected);
        assert!(verdict
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::Provenance));
    }

    #[test]
    fn traced_number_in_draft_passes_provenance() {
        let gate = create_default_gate();
        let log = log_with(
            StageName::Quant,
            json!({"metrics": {"last_close": {"value": 182.5}}}),
        );
        let output = StageOutput::new(json!({
            "answer": "The close was 182.5. Not financial advice.",
            "numbers": [{"label": "last_close", "value": 182.5}]
        }));
        let verdict = gate.validate(StageName::Draft, &output, &log);
        assert_eq!(verdict.status, VerdictStatus::Approved);
    }

    #[test]
    fn cross_source_disagreement_is_partial_without_the_contested_metric() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "metrics": {
                "last_close": {"value": 100.0, "source": "provider:twelve_data"},
                "rsi_14": {"value": 55.0, "source": "sandbox"}
            },
            "cross_source": [
                {"label": "last_close", "primary": 100.0, "secondary": 110.0}
            ]
        }));
        let verdict = gate.validate(StageName::Quant, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Partial);
        assert!(verdict
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::CrossSource));

        let subset = verdict.approved_subset.unwrap();
        assert!(subset["metrics"].get("last_close").is_none());
        assert!(subset["metrics"].get("rsi_14").is_some());
    }

    #[test]
    fn blocking_failure_is_not_rescued_by_a_nonblocking_subset() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "metrics": {"rsi_14": {"value": 140.0, "source": "sandbox"}},
            "cross_source": [
                {"label": "last_close", "primary": 100.0, "secondary": 110.0}
            ]
        }));
        let verdict = gate.validate(StageName::Quant, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Rejected);
        assert!(verdict.approved_subset.is_none());
        assert_eq!(verdict.required_reruns, vec![StageName::Quant]);
    }

    #[test]
    fn gate_is_idempotent_for_identical_input() {
        let gate = create_default_gate();
        let output = StageOutput::new(json!({
            "metrics": {"rsi_14": {"value": 140.0, "source": "sandbox"}}
        }));
        let log = ContextLog::new();
        let first = gate.validate(StageName::Quant, &output, &log);
        let second = gate.validate(StageName::Quant, &output, &log);
        assert_eq!(first.status, second.status);
        assert_eq!(first.required_reruns, second.required_reruns);
        assert_eq!(first.issues.len(), second.issues.len());
        assert_eq!(first.checks.len(), second.checks.len());
    }

    #[test]
    fn degraded_quant_with_limitation_passes_completeness() {
        let gate = create_default_gate();
        let output = StageOutput::with_limitations(
            json!({"skipped": "no symbol available"}),
            vec!["quantitative analysis skipped".to_string()],
        );
        let verdict = gate.validate(StageName::Quant, &output, &ContextLog::new());
        assert_eq!(verdict.status, VerdictStatus::Approved);
    }
}

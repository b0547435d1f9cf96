//! Planning stage
//!
//! Decides which downstream modules run and normalizes their inputs. The
//! LLM proposes the module plan as JSON; a deterministic keyword fallback
//! covers unparsable responses so planning never hard-fails on a malformed
//! completion.

use super::{Stage, StageContext};
use crate::llm::LlmClient;
use crate::models::{StageName, StageOutput, TraceEvent, TraceEventKind};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Which optional modules the pipeline runs for this request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePlan {
    pub use_research: bool,
    pub use_quant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    pub max_articles: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantRequest {
    pub symbol: String,
    pub interval: String,
    pub outputsize: u32,
    pub horizon_days: u32,
}

/// Payload shape of a successful Plan entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPayload {
    pub modules: ModulePlan,
    pub research_request: ResearchRequest,
    pub quant_request: Option<QuantRequest>,
}

pub struct PlanStage {
    llm: Arc<dyn LlmClient>,
}

impl PlanStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_prompt(ctx: &StageContext<'_>) -> String {
        let ticker_hint = if ctx.request.tickers.is_empty() {
            "none provided".to_string()
        } else {
            ctx.request.tickers.join(", ")
        };

        let base_prompt = format!(
            r#"You are a financial research planning engine.

Decide which analysis modules should run for the user's question and
normalize their inputs.

QUESTION:
{}

TICKER HINTS:
{}

Modules:
- research: recent news evidence with cited sources
- quant: price-history metrics for a single primary symbol

Rules:
- Enable quant only when a concrete ticker symbol can be identified
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{
  "use_research": true,
  "use_quant": true,
  "research_query": "<focused news query>",
  "symbol": "<primary ticker or null>"
}}
"#,
            ctx.request.query, ticker_hint,
        );

        let issues = latest_audit_issues(ctx);
        if issues.is_empty() {
            base_prompt
        } else {
            format!(
                "A previous plan was rejected by the audit:\n{}\n\nGenerate a DIFFERENT improved plan.\n\n{}",
                issues.join("\n"),
                base_prompt
            )
        }
    }
}

#[async_trait]
impl Stage for PlanStage {
    fn name(&self) -> StageName {
        StageName::Plan
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        ctx.trace.emit(
            ctx.job_id,
            TraceEvent::tool(
                TraceEventKind::ToolStarted,
                StageName::Plan,
                "llm_planner",
                "requesting module plan",
            ),
        );

        let mut limitations = Vec::new();
        let prompt = Self::build_prompt(ctx);

        let proposal = match self.llm.generate(&prompt).await {
            Ok(response) => match parse_plan_response(&response) {
                Some(proposal) => proposal,
                None => {
                    warn!("Planner response did not parse; using keyword fallback");
                    limitations
                        .push("planner response unparsable; used keyword fallback".to_string());
                    keyword_fallback(&ctx.request.query)
                }
            },
            Err(e) => {
                warn!(error = %e, "Planner call failed; using keyword fallback");
                limitations.push("planner unavailable; used keyword fallback".to_string());
                keyword_fallback(&ctx.request.query)
            }
        };

        // A ticker supplied with the request beats whatever the planner
        // guessed.
        let symbol = ctx
            .request
            .primary_symbol()
            .map(|s| s.to_uppercase())
            .or(proposal.symbol);

        let quant_request = match (proposal.use_quant, symbol) {
            (true, Some(symbol)) => Some(QuantRequest {
                symbol,
                interval: ctx.request.interval.clone(),
                outputsize: ctx.request.outputsize,
                horizon_days: ctx.request.horizon_days,
            }),
            (true, None) => {
                limitations.push(
                    "no ticker symbol identified; quantitative analysis skipped".to_string(),
                );
                None
            }
            (false, _) => None,
        };

        let payload = PlanPayload {
            modules: ModulePlan {
                use_research: proposal.use_research,
                use_quant: quant_request.is_some(),
            },
            research_request: ResearchRequest {
                query: proposal
                    .research_query
                    .unwrap_or_else(|| ctx.request.query.clone()),
                max_articles: ctx.request.max_articles,
            },
            quant_request,
        };

        info!(
            use_research = payload.modules.use_research,
            use_quant = payload.modules.use_quant,
            "Plan produced"
        );
        ctx.trace.emit(
            ctx.job_id,
            TraceEvent::tool(
                TraceEventKind::ToolCompleted,
                StageName::Plan,
                "llm_planner",
                "module plan ready",
            ),
        );

        Ok(StageOutput::with_limitations(
            serde_json::to_value(payload)?,
            limitations,
        ))
    }
}

/// What the planner model proposed, before normalization.
struct PlanProposal {
    use_research: bool,
    use_quant: bool,
    research_query: Option<String>,
    symbol: Option<String>,
}

/// Parse the planner's JSON, stripping an optional markdown fence.
fn parse_plan_response(response: &str) -> Option<PlanProposal> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json: serde_json::Value = serde_json::from_str(cleaned).ok()?;
    if !json.is_object() {
        return None;
    }

    Some(PlanProposal {
        use_research: json
            .get("use_research")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        use_quant: json
            .get("use_quant")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        research_query: json
            .get("research_query")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty()),
        symbol: json
            .get("symbol")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty()),
    })
}

const SYMBOL_STOPWORDS: &[&str] = &[
    "A", "I", "IS", "THE", "AND", "OR", "FOR", "HOW", "WHY", "WHAT", "ETF", "USD", "NEWS", "RSI",
    "PE", "EPS",
];

/// Deterministic plan when the model response is unusable: research always
/// runs, quant runs when the query contains something that looks like a
/// ticker.
fn keyword_fallback(query: &str) -> PlanProposal {
    let symbol = query
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|token| {
            token.len() >= 2
                && token.len() <= 5
                && token.chars().all(|c| c.is_ascii_uppercase())
                && !SYMBOL_STOPWORDS.contains(token)
        })
        .map(|s| s.to_string());

    PlanProposal {
        use_research: true,
        use_quant: symbol.is_some(),
        research_query: None,
        symbol,
    }
}

/// Issues from the most recent audit entry, used to steer a repair attempt.
fn latest_audit_issues(ctx: &StageContext<'_>) -> Vec<String> {
    if ctx.attempt <= 1 {
        return Vec::new();
    }
    ctx.log
        .entries()
        .iter()
        .rev()
        .find(|e| e.stage == StageName::Audit)
        .and_then(|e| {
            serde_json::from_value::<crate::models::AuditRecord>(e.payload.clone()).ok()
        })
        .map(|record| {
            record
                .verdict
                .issues
                .iter()
                .map(|i| format!("{}: {}", i.problem, i.fix_action))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::models::{ContextLog, Request};
    use crate::trace::NullTraceSink;
    use uuid::Uuid;

    async fn run_plan(llm: ScriptedLlm, request: &Request) -> StageOutput {
        let stage = PlanStage::new(Arc::new(llm));
        let log = ContextLog::new();
        let sink = NullTraceSink;
        let ctx = StageContext {
            job_id: Uuid::new_v4(),
            request,
            log: &log,
            attempt: 1,
            trace: &sink,
        };
        stage.run(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn fenced_json_plan_is_parsed() {
        let llm = ScriptedLlm::single(
            "```json\n{\"use_research\": true, \"use_quant\": true, \"research_query\": \"AAPL news\", \"symbol\": \"aapl\"}\n```",
        );
        let output = run_plan(llm, &Request::from_query("How is Apple doing?")).await;
        let payload: PlanPayload = serde_json::from_value(output.payload).unwrap();
        assert!(payload.modules.use_research);
        assert!(payload.modules.use_quant);
        assert_eq!(payload.quant_request.unwrap().symbol, "AAPL");
        assert_eq!(payload.research_request.query, "AAPL news");
    }

    #[tokio::test]
    async fn unparsable_response_falls_back_to_keywords() {
        let llm = ScriptedLlm::single("I think you should run everything!");
        let output = run_plan(llm, &Request::from_query("Is MSFT overvalued?")).await;
        let payload: PlanPayload = serde_json::from_value(output.payload).unwrap();
        assert!(payload.modules.use_research);
        assert!(payload.modules.use_quant);
        assert_eq!(payload.quant_request.unwrap().symbol, "MSFT");
    }

    #[tokio::test]
    async fn quant_disabled_without_a_symbol() {
        let llm = ScriptedLlm::single(
            "{\"use_research\": true, \"use_quant\": true, \"symbol\": null}",
        );
        let request = Request::from_query("what is happening in markets today");
        let output = run_plan(llm, &request).await;
        let payload: PlanPayload = serde_json::from_value(output.payload.clone()).unwrap();
        assert!(!payload.modules.use_quant);
        assert!(payload.quant_request.is_none());
        assert!(output
            .limitations
            .iter()
            .any(|l| l.contains("quantitative analysis skipped")));
    }

    #[tokio::test]
    async fn request_ticker_overrides_planner_guess() {
        let llm = ScriptedLlm::single(
            "{\"use_research\": true, \"use_quant\": true, \"symbol\": \"TSLA\"}",
        );
        let mut request = Request::from_query("compare");
        request.tickers = vec!["NVDA".to_string()];
        let output = run_plan(llm, &request).await;
        let payload: PlanPayload = serde_json::from_value(output.payload).unwrap();
        assert_eq!(payload.quant_request.unwrap().symbol, "NVDA");
    }

    #[test]
    fn keyword_fallback_ignores_stopwords() {
        let proposal = keyword_fallback("WHY is THE market down");
        assert!(proposal.symbol.is_none());
        let proposal = keyword_fallback("thoughts on AMD earnings");
        assert_eq!(proposal.symbol.as_deref(), Some("AMD"));
    }
}

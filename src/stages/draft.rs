//! Draft stage
//!
//! Deterministic markdown synthesis from audited material. Only APPROVED
//! payloads (or approved subsets) are quoted; numbers are copied from the
//! log verbatim, never recomputed; rejected material may only be described
//! as missing.

use super::{Stage, StageContext};
use crate::models::{StageName, StageOutput, TracedNumber};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

const DISCLAIMER: &str =
    "*This is automated research output, not financial advice. Verify independently before acting.*";

pub struct DraftStage;

impl DraftStage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DraftStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for DraftStage {
    fn name(&self) -> StageName {
        StageName::Draft
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let research = ctx.log.approved_payload(StageName::Research);
        let quant = ctx.log.approved_payload(StageName::Quant);

        let mut sections = Vec::new();
        let mut numbers: Vec<TracedNumber> = Vec::new();
        let mut sources: Vec<String> = Vec::new();

        sections.push(format!("## {}\n", ctx.request.query.trim()));

        match &quant {
            Some(payload) if payload.get("metrics").is_some() => {
                sections.push(quant_section(payload, &mut numbers));
            }
            Some(_) | None => {
                sections.push(
                    "### Quantitative snapshot\n\nQuantitative analysis is not available for this request.\n"
                        .to_string(),
                );
            }
        }

        match &research {
            Some(payload) => {
                sections.push(research_section(payload, &mut sources));
            }
            None => {
                sections.push(
                    "### Recent news\n\nNo audited news evidence is available for this request.\n"
                        .to_string(),
                );
            }
        }

        let limitations = ctx.log.all_limitations();
        if !limitations.is_empty() {
            let mut block = String::from("### Limitations\n\n");
            for limitation in &limitations {
                block.push_str(&format!("- {}\n", limitation));
            }
            sections.push(block);
        }

        if ctx.request.sources_requested && !sources.is_empty() {
            let mut block = String::from("### Sources\n\n");
            for source in &sources {
                block.push_str(&format!("- {}\n", source));
            }
            sections.push(block);
        }

        sections.push(format!("---\n{}\n", DISCLAIMER));
        let answer = sections.join("\n");

        info!(
            number_count = numbers.len(),
            source_count = sources.len(),
            "Draft synthesized"
        );

        Ok(StageOutput::new(json!({
            "answer": answer,
            "numbers": numbers,
            "sources": sources,
        })))
    }
}

/// Render the audited quant metrics as a markdown table, collecting each
/// quoted number with its recorded source.
fn quant_section(payload: &Value, numbers: &mut Vec<TracedNumber>) -> String {
    let symbol = payload
        .get("symbol")
        .and_then(Value::as_str)
        .unwrap_or("the symbol");
    let mut block = format!("### Quantitative snapshot for {}\n\n", symbol);
    block.push_str("| Metric | Value |\n|---|---|\n");

    let metric_rows: &[(&str, &str)] = &[
        ("last_close", "Last close"),
        ("pct_return", "Return over horizon (%)"),
        ("annualized_vol_pct", "Annualized volatility (%)"),
        ("sma_20", "SMA-20"),
        ("rsi_14", "RSI-14"),
        ("max_drawdown_pct", "Max drawdown (%)"),
    ];

    if let Some(metrics) = payload.get("metrics").and_then(Value::as_object) {
        for (key, label) in metric_rows {
            let Some(metric) = metrics.get(*key) else {
                continue;
            };
            let Some(value) = metric.get("value").and_then(Value::as_f64) else {
                continue;
            };
            let source = metric
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("sandbox");
            block.push_str(&format!("| {} | {} |\n", label, value));
            numbers.push(TracedNumber {
                label: key.to_string(),
                value,
                source: source.to_string(),
            });
        }
    }

    if let Some(fundamentals) = payload.get("fundamentals").and_then(Value::as_object) {
        for (key, label) in [
            ("pe_ratio", "P/E ratio"),
            ("eps", "EPS"),
            ("dividend_yield", "Dividend yield"),
        ] {
            let Some(metric) = fundamentals.get(key) else {
                continue;
            };
            let Some(value) = metric.get("value").and_then(Value::as_f64) else {
                continue;
            };
            let source = metric
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("provider:unknown");
            block.push_str(&format!("| {} | {} |\n", label, value));
            numbers.push(TracedNumber {
                label: key.to_string(),
                value,
                source: source.to_string(),
            });
        }
    }

    block
}

fn research_section(payload: &Value, sources: &mut Vec<String>) -> String {
    let mut block = String::from("### Recent news\n\n");
    let findings = payload
        .get("findings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if findings.is_empty() {
        block.push_str("No recent news evidence was found.\n");
        return block;
    }

    for finding in &findings {
        let headline = finding
            .get("headline")
            .and_then(Value::as_str)
            .unwrap_or("(untitled)");
        let url = finding.get("url").and_then(Value::as_str).unwrap_or("");
        let published = finding
            .get("published_at")
            .and_then(Value::as_str)
            .unwrap_or("");
        block.push_str(&format!("- {} ({})\n", headline, published));
        if !url.is_empty() && !sources.contains(&url.to_string()) {
            sources.push(url.to_string());
        }
    }

    block
}

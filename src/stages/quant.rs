//! Quantitative stage
//!
//! Fetches price history (and fundamentals when configured) through the
//! provider chain, then computes every metric inside the sandbox. No metric
//! is ever computed outside it, and a sandbox CODE_ERROR triggers a bounded
//! script repair before the metric is dropped with a limitation.

use super::{Stage, StageContext};
use crate::models::{
    DataPayload, FundamentalsData, OhlcvSeries, ProviderResult, StageName, StageOutput,
    TraceEvent, TraceEventKind,
};
use crate::providers::{DataRequest, ProviderChain, RequestKind};
use crate::sandbox::{Sandbox, SandboxData, SandboxOutcome, SandboxValue};
use crate::stages::plan::{PlanPayload, QuantRequest};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub struct QuantStage {
    chain: Arc<ProviderChain>,
    sandbox: Sandbox,
    sandbox_retry_cap: u32,
}

impl QuantStage {
    pub fn new(chain: Arc<ProviderChain>, sandbox: Sandbox, sandbox_retry_cap: u32) -> Self {
        Self {
            chain,
            sandbox,
            sandbox_retry_cap,
        }
    }
}

#[async_trait]
impl Stage for QuantStage {
    fn name(&self) -> StageName {
        StageName::Quant
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let Some(quant_request) = planned_quant(ctx) else {
            return Ok(StageOutput::with_limitations(
                json!({ "skipped": "no symbol available for quantitative analysis" }),
                vec!["quantitative analysis skipped: no symbol available".to_string()],
            ));
        };

        ctx.trace.emit(
            ctx.job_id,
            TraceEvent::tool(
                TraceEventKind::ToolStarted,
                StageName::Quant,
                "market_data",
                format!("fetching {} price history", quant_request.symbol),
            ),
        );

        let market_request = DataRequest::MarketData {
            symbol: quant_request.symbol.clone(),
            interval: quant_request.interval.clone(),
            outputsize: quant_request.outputsize,
        };
        let fundamentals_request = DataRequest::Fundamentals {
            symbol: quant_request.symbol.clone(),
        };
        let want_fundamentals = self.chain.has_provider_for(RequestKind::Fundamentals);

        let (market, fundamentals) = tokio::join!(self.chain.fetch(&market_request), async {
            if want_fundamentals {
                Some(self.chain.fetch(&fundamentals_request).await)
            } else {
                None
            }
        });

        let Some(DataPayload::Series(series)) = market.payload else {
            let reason = market
                .error
                .unwrap_or_else(|| "market data fetch returned no data".to_string());
            ctx.trace.emit(
                ctx.job_id,
                TraceEvent::tool(
                    TraceEventKind::ToolFailed,
                    StageName::Quant,
                    "market_data",
                    reason.clone(),
                ),
            );
            return Ok(StageOutput::with_limitations(
                json!({ "skipped": format!("price history unavailable for {}", quant_request.symbol) }),
                vec![format!(
                    "price history unavailable for {}: {}",
                    quant_request.symbol, reason
                )],
            ));
        };
        let market_provider = market.provider.unwrap_or_default();

        let mut limitations = Vec::new();
        let metrics = self
            .compute_metrics(ctx, &series, &quant_request, &market_provider, &mut limitations)
            .await;

        let fundamentals_value =
            fundamentals_section(fundamentals, want_fundamentals, &mut limitations);

        info!(
            symbol = %quant_request.symbol,
            provider = %market_provider,
            bars = series.bars.len(),
            metric_count = metrics.len(),
            "Quant completed"
        );
        ctx.trace.emit(
            ctx.job_id,
            TraceEvent::tool(
                TraceEventKind::ToolCompleted,
                StageName::Quant,
                "market_data",
                format!("{} bars via {}", series.bars.len(), market_provider),
            ),
        );

        let mut payload = Map::new();
        payload.insert("symbol".to_string(), json!(quant_request.symbol));
        payload.insert("interval".to_string(), json!(quant_request.interval));
        payload.insert("bars".to_string(), json!(series.bars.len()));
        payload.insert("provider".to_string(), json!(market_provider));
        payload.insert("metrics".to_string(), Value::Object(metrics));
        if let Some(fundamentals_value) = fundamentals_value {
            payload.insert("fundamentals".to_string(), fundamentals_value);
        }

        Ok(StageOutput::with_limitations(
            Value::Object(payload),
            limitations,
        ))
    }
}

impl QuantStage {
    async fn compute_metrics(
        &self,
        ctx: &StageContext<'_>,
        series: &OhlcvSeries,
        quant_request: &QuantRequest,
        market_provider: &str,
        limitations: &mut Vec<String>,
    ) -> Map<String, Value> {
        let closes = series.closes();
        let points = closes.len();
        let mut data = SandboxData::new();
        data.insert("close".to_string(), SandboxValue::Series(closes));

        let horizon = quant_request.horizon_days as usize;
        let effective_horizon = horizon.min(points.saturating_sub(1)).max(1);

        let specs = metric_specs(horizon, effective_horizon, points);

        let mut metrics = Map::new();
        for spec in specs {
            ctx.trace.emit(
                ctx.job_id,
                TraceEvent::tool(
                    TraceEventKind::ToolStarted,
                    StageName::Quant,
                    "sandbox",
                    format!("computing {}", spec.name),
                ),
            );
            match run_scripts(&self.sandbox, &data, &spec.scripts, self.sandbox_retry_cap).await {
                Ok(value) => {
                    let source = if spec.provider_sourced {
                        format!("provider:{}", market_provider)
                    } else {
                        "sandbox".to_string()
                    };
                    metrics.insert(
                        spec.name.to_string(),
                        json!({ "value": value, "source": source }),
                    );
                    ctx.trace.emit(
                        ctx.job_id,
                        TraceEvent::tool(
                            TraceEventKind::ToolCompleted,
                            StageName::Quant,
                            "sandbox",
                            format!("{} = {}", spec.name, value),
                        ),
                    );
                }
                Err(message) => {
                    warn!(metric = spec.name, %message, "Metric dropped after script repair");
                    limitations.push(format!("could not compute {}: {}", spec.name, message));
                    ctx.trace.emit(
                        ctx.job_id,
                        TraceEvent::tool(
                            TraceEventKind::ToolFailed,
                            StageName::Quant,
                            "sandbox",
                            format!("{}: {}", spec.name, message),
                        ),
                    );
                }
            }
        }
        metrics
    }
}

struct MetricSpec {
    name: &'static str,
    /// Candidate scripts in order; later entries are repaired variants.
    scripts: Vec<String>,
    /// Whether the value is read straight off provider data rather than
    /// derived.
    provider_sourced: bool,
}

fn metric_specs(horizon: usize, effective_horizon: usize, points: usize) -> Vec<MetricSpec> {
    let sma_window = 20.min(points).max(1);
    let rsi_window = 14.min(points.saturating_sub(1)).max(1);
    vec![
        MetricSpec {
            name: "last_close",
            scripts: vec!["last(close)".to_string()],
            provider_sourced: true,
        },
        MetricSpec {
            name: "pct_return",
            scripts: vec![
                format!("round2(pct_change(close, {}))", horizon),
                format!("round2(pct_change(close, {}))", effective_horizon),
            ],
            provider_sourced: false,
        },
        MetricSpec {
            name: "annualized_vol_pct",
            scripts: vec!["round2(annualized_vol(close))".to_string()],
            provider_sourced: false,
        },
        MetricSpec {
            name: "sma_20",
            scripts: vec![
                "round2(sma(close, 20))".to_string(),
                format!("round2(sma(close, {}))", sma_window),
            ],
            provider_sourced: false,
        },
        MetricSpec {
            name: "rsi_14",
            scripts: vec![
                "round2(rsi(close, 14))".to_string(),
                format!("round2(rsi(close, {}))", rsi_window),
            ],
            provider_sourced: false,
        },
        MetricSpec {
            name: "max_drawdown_pct",
            scripts: vec!["round2(max_drawdown(close))".to_string()],
            provider_sourced: false,
        },
    ]
}

/// Try candidate scripts in order. A CODE_ERROR moves on to the next
/// (repaired) script; attempts are capped at 1 + `retry_cap`. The value of
/// the first successful script is the only value returned.
pub(crate) async fn run_scripts(
    sandbox: &Sandbox,
    data: &SandboxData,
    scripts: &[String],
    retry_cap: u32,
) -> std::result::Result<f64, String> {
    let max_attempts = (1 + retry_cap as usize).min(scripts.len());
    let mut last_error = "no script provided".to_string();

    for script in scripts.iter().take(max_attempts) {
        match sandbox.execute(script, data).await {
            SandboxOutcome::Success { final_output } => {
                return final_output
                    .as_f64()
                    .ok_or_else(|| "script produced a non-numeric result".to_string());
            }
            SandboxOutcome::CodeError { message } => {
                warn!(%script, %message, "Sandbox script failed, trying repaired script");
                last_error = message;
            }
        }
    }
    Err(last_error)
}

fn planned_quant(ctx: &StageContext<'_>) -> Option<QuantRequest> {
    let planned = ctx
        .log
        .latest_success(StageName::Plan)
        .and_then(|entry| serde_json::from_value::<PlanPayload>(entry.payload.clone()).ok())
        .and_then(|plan| plan.quant_request);

    planned.or_else(|| {
        ctx.request.primary_symbol().map(|symbol| QuantRequest {
            symbol: symbol.to_uppercase(),
            interval: ctx.request.interval.clone(),
            outputsize: ctx.request.outputsize,
            horizon_days: ctx.request.horizon_days,
        })
    })
}

/// Fold an optional fundamentals fetch into a payload section, recording a
/// limitation instead of fabricating values when nothing is available.
fn fundamentals_section(
    fundamentals: Option<ProviderResult>,
    want_fundamentals: bool,
    limitations: &mut Vec<String>,
) -> Option<Value> {
    if !want_fundamentals {
        limitations.push("fundamentals unavailable: no fundamentals provider configured".to_string());
        return None;
    }
    let result = fundamentals?;
    let provider = result.provider.clone().unwrap_or_default();
    match result.payload {
        Some(DataPayload::Fundamentals(data)) => Some(fundamentals_value(&data, &provider)),
        _ => {
            limitations.push(format!(
                "fundamentals unavailable: {}",
                result
                    .error
                    .unwrap_or_else(|| "fetch returned no data".to_string())
            ));
            None
        }
    }
}

fn fundamentals_value(data: &FundamentalsData, provider: &str) -> Value {
    let source = format!("provider:{}", provider);
    let mut map = Map::new();
    map.insert("symbol".to_string(), json!(data.symbol));
    if let Some(name) = &data.name {
        map.insert("name".to_string(), json!(name));
    }
    if let Some(sector) = &data.sector {
        map.insert("sector".to_string(), json!(sector));
    }
    for (key, value) in [
        ("pe_ratio", data.pe_ratio),
        ("eps", data.eps),
        ("market_cap", data.market_cap),
        ("dividend_yield", data.dividend_yield),
    ] {
        if let Some(value) = value {
            map.insert(key.to_string(), json!({ "value": value, "source": source }));
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextLog, Request};
    use crate::providers::testing::StaticMarketProvider;
    use crate::trace::NullTraceSink;
    use std::time::Duration;
    use uuid::Uuid;

    fn sandbox() -> Sandbox {
        Sandbox::new(Duration::from_secs(2))
    }

    fn close_series(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + (i as f64) * 0.5).collect()
    }

    async fn run_quant(chain: ProviderChain, request: &Request) -> StageOutput {
        let stage = QuantStage::new(Arc::new(chain), sandbox(), 2);
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
    async fn metrics_are_computed_and_tagged_with_sources() {
        let chain = ProviderChain::new(vec![Arc::new(StaticMarketProvider {
            name: "feed",
            closes: close_series(60),
        })]);
        let mut request = Request::from_query("how is AAPL doing");
        request.tickers = vec!["AAPL".to_string()];

        let output = run_quant(chain, &request).await;
        let metrics = output.payload["metrics"].as_object().unwrap();

        assert_eq!(
            metrics["last_close"]["source"].as_str().unwrap(),
            "provider:feed"
        );
        assert_eq!(metrics["rsi_14"]["source"].as_str().unwrap(), "sandbox");
        let rsi = metrics["rsi_14"]["value"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&rsi));
        assert!(metrics.contains_key("annualized_vol_pct"));
        assert!(metrics.contains_key("max_drawdown_pct"));
    }

    #[tokio::test]
    async fn short_series_repairs_window_scripts() {
        // 10 points cannot satisfy the 30-day return or the 14-period RSI;
        // the repaired scripts with shrunk windows must succeed.
        let chain = ProviderChain::new(vec![Arc::new(StaticMarketProvider {
            name: "feed",
            closes: close_series(10),
        })]);
        let mut request = Request::from_query("TSLA");
        request.tickers = vec!["TSLA".to_string()];

        let output = run_quant(chain, &request).await;
        let metrics = output.payload["metrics"].as_object().unwrap();
        assert!(metrics.contains_key("pct_return"));
        assert!(metrics.contains_key("rsi_14"));
        assert!(metrics.contains_key("sma_20"));
    }

    #[tokio::test]
    async fn missing_symbol_yields_skipped_payload() {
        let chain = ProviderChain::new(vec![Arc::new(StaticMarketProvider {
            name: "feed",
            closes: close_series(60),
        })]);
        let request = Request::from_query("what is the market mood");

        let output = run_quant(chain, &request).await;
        assert!(output.payload.get("skipped").is_some());
        assert!(output
            .limitations
            .iter()
            .any(|l| l.contains("no symbol available")));
    }

    #[tokio::test]
    async fn no_fundamentals_provider_means_limitation_and_no_pe() {
        let chain = ProviderChain::new(vec![Arc::new(StaticMarketProvider {
            name: "feed",
            closes: close_series(60),
        })]);
        let mut request = Request::from_query("AAPL");
        request.tickers = vec!["AAPL".to_string()];

        let output = run_quant(chain, &request).await;
        assert!(output.payload.get("fundamentals").is_none());
        assert!(output
            .limitations
            .iter()
            .any(|l| l.contains("fundamentals unavailable")));
    }

    #[tokio::test]
    async fn market_data_unavailable_is_a_limitation_not_an_error() {
        let chain = ProviderChain::new(Vec::new());
        let mut request = Request::from_query("AAPL");
        request.tickers = vec!["AAPL".to_string()];

        let output = run_quant(chain, &request).await;
        assert!(output.payload.get("skipped").is_some());
        assert!(output
            .limitations
            .iter()
            .any(|l| l.contains("price history unavailable")));
    }

    #[tokio::test]
    async fn divide_by_zero_script_is_repaired_once() {
        let mut data = SandboxData::new();
        data.insert(
            "close".to_string(),
            SandboxValue::Series(vec![10.0, 11.0, 12.0]),
        );
        let scripts = vec![
            "100 / (last(close) - last(close))".to_string(),
            "last(close)".to_string(),
        ];

        let value = run_scripts(&sandbox(), &data, &scripts, 2).await.unwrap();
        assert_eq!(value, 12.0);
    }

    #[tokio::test]
    async fn retry_cap_bounds_script_attempts() {
        let mut data = SandboxData::new();
        data.insert(
            "close".to_string(),
            SandboxValue::Series(vec![10.0, 11.0, 12.0]),
        );
        // Three broken scripts, cap of 1 retry: the third never runs and
        // the reported error comes from the second.
        let scripts = vec![
            "1 / 0".to_string(),
            "unknown_fn(close)".to_string(),
            "last(close)".to_string(),
        ];

        let err = run_scripts(&sandbox(), &data, &scripts, 1)
            .await
            .unwrap_err();
        assert!(err.contains("unknown function"));
    }
}

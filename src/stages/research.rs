//! Research stage
//!
//! Gathers recent news evidence for the planned query through the provider
//! chain. Every finding carries its source url and publication date so the
//! audit can verify citations. A missing news capability degrades to an
//! empty payload with a limitation, never an error.

use super::{Stage, StageContext};
use crate::models::{DataPayload, StageName, StageOutput, TraceEvent, TraceEventKind};
use crate::providers::{DataRequest, ProviderChain, RequestKind};
use crate::stages::plan::PlanPayload;
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct ResearchStage {
    chain: Arc<ProviderChain>,
}

impl ResearchStage {
    pub fn new(chain: Arc<ProviderChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Stage for ResearchStage {
    fn name(&self) -> StageName {
        StageName::Research
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let (query, max_articles) = match planned_research(ctx) {
            Some((query, max_articles)) => (query, max_articles),
            None => (ctx.request.query.clone(), ctx.request.max_articles),
        };

        if !self.chain.has_provider_for(RequestKind::News) {
            info!("No news provider configured; research degrades gracefully");
            return Ok(StageOutput::with_limitations(
                json!({ "findings": [], "query": query }),
                vec!["news search unavailable; no news provider configured".to_string()],
            ));
        }

        ctx.trace.emit(
            ctx.job_id,
            TraceEvent::tool(
                TraceEventKind::ToolStarted,
                StageName::Research,
                "news_search",
                format!("searching news for '{}'", query),
            ),
        );

        let result = self
            .chain
            .fetch(&DataRequest::News {
                query: query.clone(),
                max_articles,
            })
            .await;

        let Some(DataPayload::Articles(articles)) = result.payload else {
            let reason = result
                .error
                .unwrap_or_else(|| "news fetch returned no data".to_string());
            ctx.trace.emit(
                ctx.job_id,
                TraceEvent::tool(
                    TraceEventKind::ToolFailed,
                    StageName::Research,
                    "news_search",
                    reason.clone(),
                ),
            );
            return Ok(StageOutput::with_limitations(
                json!({ "findings": [], "query": query }),
                vec![format!("news evidence unavailable: {}", reason)],
            ));
        };

        let provider = result.provider.unwrap_or_default();
        let findings: Vec<serde_json::Value> = articles
            .iter()
            .map(|a| {
                json!({
                    "headline": a.headline,
                    "url": a.url,
                    "snippet": a.snippet,
                    "source": a.source,
                    "published_at": a.published_at,
                    "provider": provider,
                })
            })
            .collect();

        info!(
            finding_count = findings.len(),
            provider = %provider,
            "Research completed"
        );
        ctx.trace.emit(
            ctx.job_id,
            TraceEvent::tool(
                TraceEventKind::ToolCompleted,
                StageName::Research,
                "news_search",
                format!("{} findings via {}", findings.len(), provider),
            ),
        );

        Ok(StageOutput::new(json!({
            "findings": findings,
            "query": query,
            "provider": provider,
        })))
    }
}

fn planned_research(ctx: &StageContext<'_>) -> Option<(String, u32)> {
    let entry = ctx.log.latest_success(StageName::Plan)?;
    let plan: PlanPayload = serde_json::from_value(entry.payload.clone()).ok()?;
    Some((
        plan.research_request.query,
        plan.research_request.max_articles,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextLog, Request};
    use crate::providers::testing::{article, FailingProvider, StaticNewsProvider};
    use crate::providers::ProviderFailure;
    use crate::trace::NullTraceSink;
    use uuid::Uuid;

    async fn run_research(chain: ProviderChain) -> StageOutput {
        let stage = ResearchStage::new(Arc::new(chain));
        let request = Request::from_query("AAPL earnings news");
        let log = ContextLog::new();
        let sink = NullTraceSink;
        let ctx = StageContext {
            job_id: Uuid::new_v4(),
            request: &request,
            log: &log,
            attempt: 1,
            trace: &sink,
        };
        stage.run(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn findings_carry_citation_fields() {
        let chain = ProviderChain::new(vec![Arc::new(StaticNewsProvider {
            articles: vec![article("Apple beats estimates", "https://news/a")],
        })]);
        let output = run_research(chain).await;
        let findings = output.payload["findings"].as_array().unwrap();
        assert_eq!(findings.len(), 1);
        assert!(!findings[0]["url"].as_str().unwrap().is_empty());
        assert!(!findings[0]["published_at"].as_str().unwrap().is_empty());
        assert!(output.limitations.is_empty());
    }

    #[tokio::test]
    async fn no_news_provider_degrades_with_limitation() {
        let output = run_research(ProviderChain::new(Vec::new())).await;
        assert_eq!(output.payload["findings"].as_array().unwrap().len(), 0);
        assert!(output
            .limitations
            .iter()
            .any(|l| l.contains("news search unavailable")));
    }

    #[tokio::test]
    async fn all_providers_failing_degrades_with_limitation() {
        let chain = ProviderChain::new(vec![Arc::new(FailingProvider::new(
            "flaky",
            ProviderFailure::Http("connection refused".to_string()),
        ))]);
        let output = run_research(chain).await;
        assert_eq!(output.payload["findings"].as_array().unwrap().len(), 0);
        assert!(output
            .limitations
            .iter()
            .any(|l| l.contains("news evidence unavailable")));
    }
}

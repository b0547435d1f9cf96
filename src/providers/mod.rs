//! Data provider chain with ordered fallback
//!
//! External market/news/fundamentals data comes through an ordered list of
//! providers. Failures are non-fatal: the chain proceeds to the next
//! provider, and only when every candidate fails does it return an explicit
//! "unavailable" result. Every successful result records which provider
//! answered, so downstream stages can tag provenance.

use crate::config::Capabilities;
use crate::models::{DataPayload, ProviderResult};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

mod alpha_vantage;
mod serper;
mod stooq;
mod twelve_data;

pub use alpha_vantage::AlphaVantageProvider;
pub use serper::SerperProvider;
pub use stooq::StooqProvider;
pub use twelve_data::TwelveDataProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    MarketData,
    Fundamentals,
    News,
}

impl RequestKind {
    fn label(&self) -> &'static str {
        match self {
            RequestKind::MarketData => "market data",
            RequestKind::Fundamentals => "fundamentals",
            RequestKind::News => "news",
        }
    }
}

#[derive(Debug, Clone)]
pub enum DataRequest {
    MarketData {
        symbol: String,
        interval: String,
        outputsize: u32,
    },
    Fundamentals {
        symbol: String,
    },
    News {
        query: String,
        max_articles: u32,
    },
}

impl DataRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            DataRequest::MarketData { .. } => RequestKind::MarketData,
            DataRequest::Fundamentals { .. } => RequestKind::Fundamentals,
            DataRequest::News { .. } => RequestKind::News,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DataRequest::MarketData {
                symbol, interval, ..
            } => format!("{} {} {}", self.kind().label(), symbol, interval),
            DataRequest::Fundamentals { symbol } => {
                format!("{} {}", self.kind().label(), symbol)
            }
            DataRequest::News { query, .. } => format!("{} '{}'", self.kind().label(), query),
        }
    }
}

/// Why one provider could not answer. All variants are recoverable: the
/// chain moves on to the next provider. Rate limits are not retried within
/// the same traversal.
#[derive(Debug, Clone, Error)]
pub enum ProviderFailure {
    #[error("request failed: {0}")]
    Http(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("no data returned: {0}")]
    Empty(String),
}

#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, kind: RequestKind) -> bool;
    async fn fetch(&self, request: &DataRequest) -> Result<DataPayload, ProviderFailure>;
}

/// Ordered provider list; first well-formed result wins.
pub struct ProviderChain {
    providers: Vec<Arc<dyn DataProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>) -> Self {
        Self { providers }
    }

    /// Build the default chain from the environment: Twelve Data before the
    /// keyless Stooq fallback for market data, Alpha Vantage for
    /// fundamentals, Serper for news. Unconfigured providers are simply
    /// absent from the chain.
    pub fn from_env(caps: &Capabilities) -> Self {
        let mut providers: Vec<Arc<dyn DataProvider>> = Vec::new();
        if caps.twelve_data {
            if let Some(p) = TwelveDataProvider::from_env() {
                providers.push(Arc::new(p));
            }
        }
        providers.push(Arc::new(StooqProvider::new()));
        if caps.fundamentals {
            if let Some(p) = AlphaVantageProvider::from_env() {
                providers.push(Arc::new(p));
            }
        }
        if caps.news_search {
            if let Some(p) = SerperProvider::from_env() {
                providers.push(Arc::new(p));
            }
        }
        Self::new(providers)
    }

    pub fn has_provider_for(&self, kind: RequestKind) -> bool {
        self.providers.iter().any(|p| p.supports(kind))
    }

    /// Walk the chain in order. Never returns partially-populated data: the
    /// result either carries a payload tagged with the winning provider, or
    /// an error naming every failure.
    pub async fn fetch(&self, request: &DataRequest) -> ProviderResult {
        let kind = request.kind();
        let mut failures: Vec<String> = Vec::new();

        for provider in self.providers.iter().filter(|p| p.supports(kind)) {
            debug!(
                provider = provider.name(),
                request = %request.describe(),
                "Trying provider"
            );
            match provider.fetch(request).await {
                Ok(payload) => {
                    return ProviderResult {
                        provider: Some(provider.name().to_string()),
                        payload: Some(payload),
                        error: None,
                        fetched_at: Utc::now(),
                    };
                }
                Err(failure) => {
                    warn!(
                        provider = provider.name(),
                        error = %failure,
                        "Provider failed, falling through"
                    );
                    failures.push(format!("{}: {}", provider.name(), failure));
                }
            }
        }

        let error = if failures.is_empty() {
            format!("no provider configured for {}", kind.label())
        } else {
            format!("all providers failed ({})", failures.join("; "))
        };

        ProviderResult {
            provider: None,
            payload: None,
            error: Some(error),
            fetched_at: Utc::now(),
        }
    }
}

pub(crate) fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .user_agent("FinanceInsightBot/1.0")
        .build()
        .expect("failed to build HTTP client")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{Article, OhlcvBar, OhlcvSeries};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that always fails one way, counting calls.
    pub struct FailingProvider {
        pub name: &'static str,
        pub failure: ProviderFailure,
        pub calls: AtomicUsize,
    }

    impl FailingProvider {
        pub fn new(name: &'static str, failure: ProviderFailure) -> Self {
            Self {
                name,
                failure,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DataProvider for FailingProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, _kind: RequestKind) -> bool {
            true
        }

        async fn fetch(&self, _request: &DataRequest) -> Result<DataPayload, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.failure.clone())
        }
    }

    /// Provider answering market-data requests with a fixed close series.
    pub struct StaticMarketProvider {
        pub name: &'static str,
        pub closes: Vec<f64>,
    }

    #[async_trait::async_trait]
    impl DataProvider for StaticMarketProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, kind: RequestKind) -> bool {
            kind == RequestKind::MarketData
        }

        async fn fetch(&self, request: &DataRequest) -> Result<DataPayload, ProviderFailure> {
            let DataRequest::MarketData {
                symbol, interval, ..
            } = request
            else {
                return Err(ProviderFailure::Malformed("unsupported request".into()));
            };
            let bars = self
                .closes
                .iter()
                .enumerate()
                .map(|(i, close)| OhlcvBar {
                    date: format!("2024-01-{:02}", i + 1),
                    open: *close,
                    high: *close,
                    low: *close,
                    close: *close,
                    volume: 1000.0,
                })
                .collect();
            Ok(DataPayload::Series(OhlcvSeries {
                symbol: symbol.clone(),
                interval: interval.clone(),
                bars,
            }))
        }
    }

    /// Provider answering news requests with fixed articles.
    pub struct StaticNewsProvider {
        pub articles: Vec<Article>,
    }

    #[async_trait::async_trait]
    impl DataProvider for StaticNewsProvider {
        fn name(&self) -> &'static str {
            "static_news"
        }

        fn supports(&self, kind: RequestKind) -> bool {
            kind == RequestKind::News
        }

        async fn fetch(&self, _request: &DataRequest) -> Result<DataPayload, ProviderFailure> {
            Ok(DataPayload::Articles(self.articles.clone()))
        }
    }

    pub fn article(headline: &str, url: &str) -> Article {
        Article {
            headline: headline.to_string(),
            url: url.to_string(),
            snippet: format!("{} snippet", headline),
            source: "newswire".to_string(),
            published_at: "2024-05-01".to_string(),
        }
    }
}

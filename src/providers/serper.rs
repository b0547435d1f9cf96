//! Serper news-search provider

use super::{build_http_client, DataProvider, DataRequest, ProviderFailure, RequestKind};
use crate::models::{Article, DataPayload};
use reqwest::Client;
use serde_json::{json, Value};
use std::env;

const BASE_URL: &str = "https://google.serper.dev/news";

pub struct SerperProvider {
    client: Client,
    api_key: String,
}

impl SerperProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: build_http_client(),
            api_key,
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = env::var("SERPER_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self::new(api_key))
    }
}

#[async_trait::async_trait]
impl DataProvider for SerperProvider {
    fn name(&self) -> &'static str {
        "serper"
    }

    fn supports(&self, kind: RequestKind) -> bool {
        kind == RequestKind::News
    }

    async fn fetch(&self, request: &DataRequest) -> Result<DataPayload, ProviderFailure> {
        let DataRequest::News {
            query,
            max_articles,
        } = request
        else {
            return Err(ProviderFailure::Malformed(
                "unsupported request kind".to_string(),
            ));
        };

        let response = self
            .client
            .post(BASE_URL)
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "q": query, "num": max_articles }))
            .send()
            .await
            .map_err(|e| ProviderFailure::Http(e.to_string()))?;

        if response.status().as_u16() == 429 {
            return Err(ProviderFailure::RateLimited("HTTP 429".to_string()));
        }
        if !response.status().is_success() {
            return Err(ProviderFailure::Http(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;

        let articles = parse_articles(&body, *max_articles as usize);
        if articles.is_empty() {
            return Err(ProviderFailure::Empty(format!(
                "no articles for '{}'",
                query
            )));
        }

        Ok(DataPayload::Articles(articles))
    }
}

fn parse_articles(body: &Value, limit: usize) -> Vec<Article> {
    let Some(items) = body.get("news").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let text = |key: &str| {
                item.get(key)
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            };
            Some(Article {
                headline: text("title")?,
                url: text("link")?,
                snippet: text("snippet").unwrap_or_default(),
                source: text("source").unwrap_or_default(),
                published_at: text("date").unwrap_or_default(),
            })
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_news_items_and_honors_limit() {
        let body = serde_json::json!({
            "news": [
                {"title": "A", "link": "https://a", "snippet": "s", "source": "x", "date": "1 day ago"},
                {"title": "B", "link": "https://b", "snippet": "s", "source": "y", "date": "2 days ago"},
                {"title": "C", "link": "https://c"}
            ]
        });
        let articles = parse_articles(&body, 2);
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].headline, "A");
    }

    #[test]
    fn items_without_title_or_link_are_skipped() {
        let body = serde_json::json!({
            "news": [
                {"snippet": "orphan"},
                {"title": "Ok", "link": "https://ok"}
            ]
        });
        let articles = parse_articles(&body, 10);
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].url, "https://ok");
    }
}

//! Alpha Vantage company-overview provider (fundamentals)

use super::{build_http_client, DataProvider, DataRequest, ProviderFailure, RequestKind};
use crate::models::{DataPayload, FundamentalsData};
use reqwest::Client;
use serde_json::Value;
use std::env;

const BASE_URL: &str = "https://www.alphavantage.co/query";

pub struct AlphaVantageProvider {
    client: Client,
    api_key: String,
}

impl AlphaVantageProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: build_http_client(),
            api_key,
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = env::var("ALPHAVANTAGE_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self::new(api_key))
    }
}

#[async_trait::async_trait]
impl DataProvider for AlphaVantageProvider {
    fn name(&self) -> &'static str {
        "alpha_vantage"
    }

    fn supports(&self, kind: RequestKind) -> bool {
        kind == RequestKind::Fundamentals
    }

    async fn fetch(&self, request: &DataRequest) -> Result<DataPayload, ProviderFailure> {
        let DataRequest::Fundamentals { symbol } = request else {
            return Err(ProviderFailure::Malformed(
                "unsupported request kind".to_string(),
            ));
        };

        let body: Value = self
            .client
            .get(BASE_URL)
            .query(&[
                ("function", "OVERVIEW"),
                ("symbol", symbol.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderFailure::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;

        // Alpha Vantage signals throttling with a "Note" field on HTTP 200.
        if let Some(note) = body.get("Note").and_then(Value::as_str) {
            return Err(ProviderFailure::RateLimited(note.to_string()));
        }

        if body.get("Symbol").and_then(Value::as_str).is_none() {
            return Err(ProviderFailure::Empty(format!(
                "no fundamentals for {}",
                symbol
            )));
        }

        Ok(DataPayload::Fundamentals(parse_overview(symbol, &body)))
    }
}

fn parse_overview(symbol: &str, body: &Value) -> FundamentalsData {
    FundamentalsData {
        symbol: symbol.to_string(),
        name: body
            .get("Name")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        sector: body
            .get("Sector")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        pe_ratio: numeric_field(body, "PERatio"),
        eps: numeric_field(body, "EPS"),
        market_cap: numeric_field(body, "MarketCapitalization"),
        dividend_yield: numeric_field(body, "DividendYield"),
    }
}

/// Alpha Vantage reports absent metrics as "None", "-", or "".
fn numeric_field(body: &Value, key: &str) -> Option<f64> {
    let raw = body.get(key)?.as_str()?.trim();
    if raw.is_empty() || raw == "None" || raw == "-" {
        return None;
    }
    raw.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overview_fields() {
        let body = serde_json::json!({
            "Symbol": "AAPL",
            "Name": "Apple Inc",
            "Sector": "Technology",
            "PERatio": "28.5",
            "EPS": "6.42",
            "MarketCapitalization": "2800000000000",
            "DividendYield": "0.0055"
        });
        let data = parse_overview("AAPL", &body);
        assert_eq!(data.pe_ratio, Some(28.5));
        assert_eq!(data.eps, Some(6.42));
        assert_eq!(data.sector.as_deref(), Some("Technology"));
    }

    #[test]
    fn absent_metrics_parse_as_none() {
        let body = serde_json::json!({
            "Symbol": "XYZ",
            "PERatio": "None",
            "EPS": "-",
            "DividendYield": ""
        });
        let data = parse_overview("XYZ", &body);
        assert!(data.pe_ratio.is_none());
        assert!(data.eps.is_none());
        assert!(data.dividend_yield.is_none());
    }
}

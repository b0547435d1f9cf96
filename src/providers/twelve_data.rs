//! Twelve Data time-series provider (primary market-data source)

use super::{build_http_client, DataProvider, DataRequest, ProviderFailure, RequestKind};
use crate::models::{DataPayload, OhlcvBar, OhlcvSeries};
use reqwest::Client;
use serde_json::Value;
use std::env;

const BASE_URL: &str = "https://api.twelvedata.com/time_series";

pub struct TwelveDataProvider {
    client: Client,
    api_key: String,
}

impl TwelveDataProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: build_http_client(),
            api_key,
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = env::var("TWELVE_DATA_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self::new(api_key))
    }
}

#[async_trait::async_trait]
impl DataProvider for TwelveDataProvider {
    fn name(&self) -> &'static str {
        "twelve_data"
    }

    fn supports(&self, kind: RequestKind) -> bool {
        kind == RequestKind::MarketData
    }

    async fn fetch(&self, request: &DataRequest) -> Result<DataPayload, ProviderFailure> {
        let DataRequest::MarketData {
            symbol,
            interval,
            outputsize,
        } = request
        else {
            return Err(ProviderFailure::Malformed(
                "unsupported request kind".to_string(),
            ));
        };

        let outputsize = (*outputsize).clamp(10, 2000);

        let response = self
            .client
            .get(BASE_URL)
            .query(&[
                ("symbol", symbol.as_str()),
                ("interval", interval.as_str()),
                ("outputsize", &outputsize.to_string()),
                ("apikey", self.api_key.as_str()),
                ("format", "JSON"),
            ])
            .send()
            .await
            .map_err(|e| ProviderFailure::Http(e.to_string()))?;

        if response.status().as_u16() == 429 {
            return Err(ProviderFailure::RateLimited("HTTP 429".to_string()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Malformed(e.to_string()))?;

        let Some(values) = body.get("values").and_then(Value::as_array) else {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unexpected response")
                .to_string();
            let code = body.get("code").and_then(Value::as_i64);
            if code == Some(429) || message.to_lowercase().contains("limit") {
                return Err(ProviderFailure::RateLimited(message));
            }
            return Err(ProviderFailure::Malformed(message));
        };

        // API returns newest first; rows with unparsable fields are skipped.
        let mut bars: Vec<OhlcvBar> = values.iter().filter_map(parse_bar).collect();
        bars.reverse();
        if bars.len() > outputsize as usize {
            bars.drain(..bars.len() - outputsize as usize);
        }

        if bars.is_empty() {
            return Err(ProviderFailure::Empty(format!("no rows for {}", symbol)));
        }

        Ok(DataPayload::Series(OhlcvSeries {
            symbol: symbol.clone(),
            interval: interval.clone(),
            bars,
        }))
    }
}

fn parse_bar(row: &Value) -> Option<OhlcvBar> {
    let field = |key: &str| -> Option<f64> { row.get(key)?.as_str()?.parse::<f64>().ok() };
    Some(OhlcvBar {
        date: row.get("datetime")?.as_str()?.to_string(),
        open: field("open")?,
        high: field("high")?,
        low: field("low")?,
        close: field("close")?,
        volume: field("volume").unwrap_or(0.0),
    })
}

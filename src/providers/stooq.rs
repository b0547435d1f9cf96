//! Stooq CSV provider (keyless market-data fallback)

use super::{build_http_client, DataProvider, DataRequest, ProviderFailure, RequestKind};
use crate::models::{DataPayload, OhlcvBar, OhlcvSeries};
use reqwest::Client;

pub struct StooqProvider {
    client: Client,
}

impl StooqProvider {
    pub fn new() -> Self {
        Self {
            client: build_http_client(),
        }
    }
}

impl Default for StooqProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DataProvider for StooqProvider {
    fn name(&self) -> &'static str {
        "stooq"
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

        let stooq_interval = match interval.as_str() {
            "1week" => "w",
            "1month" => "m",
            _ => "d",
        };

        // Stooq wants exchange-suffixed symbols; bare tickers default to US.
        let mut stooq_symbol = symbol.trim().to_lowercase();
        if !stooq_symbol.contains('.') {
            stooq_symbol = format!("{}.us", stooq_symbol);
        }

        let url = format!(
            "https://stooq.com/q/d/l/?s={}&i={}",
            stooq_symbol, stooq_interval
        );

        let body = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderFailure::Http(e.to_string()))?
            .text()
            .await
            .map_err(|e| ProviderFailure::Http(e.to_string()))?;

        let mut bars = parse_csv(&body);
        if bars.is_empty() {
            return Err(ProviderFailure::Empty(format!(
                "no rows for {}",
                stooq_symbol
            )));
        }
        let keep = (*outputsize).clamp(10, 2000) as usize;
        if bars.len() > keep {
            bars.drain(..bars.len() - keep);
        }

        Ok(DataPayload::Series(OhlcvSeries {
            symbol: symbol.clone(),
            interval: interval.clone(),
            bars,
        }))
    }
}

/// Parse Stooq's `Date,Open,High,Low,Close,Volume` CSV. Rows with missing
/// or unparsable fields are skipped.
fn parse_csv(body: &str) -> Vec<OhlcvBar> {
    let mut lines = body.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    if !header.to_lowercase().starts_with("date") {
        return Vec::new();
    }

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 5 || fields[0].is_empty() {
                return None;
            }
            Some(OhlcvBar {
                date: fields[0].to_string(),
                open: fields[1].parse().ok()?,
                high: fields[2].parse().ok()?,
                low: fields[3].parse().ok()?,
                close: fields[4].parse().ok()?,
                volume: fields.get(5).and_then(|v| v.parse().ok()).unwrap_or(0.0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_csv() {
        let body = "Date,Open,High,Low,Close,Volume\n\
                    2024-05-01,100,102,99,101,120000\n\
                    2024-05-02,101,103,100,102,98000\n";
        let bars = parse_csv(body);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, "2024-05-01");
        assert_eq!(bars[1].close, 102.0);
    }

    #[test]
    fn skips_bad_rows_and_rejects_non_csv() {
        let body = "Date,Open,High,Low,Close,Volume\n\
                    2024-05-01,100,102,99,101,120000\n\
                    2024-05-02,broken,103,100,102,98000\n";
        assert_eq!(parse_csv(body).len(), 1);
        assert!(parse_csv("<html>No data</html>").is_empty());
    }

    #[test]
    fn row_without_volume_defaults_to_zero() {
        let body = "Date,Open,High,Low,Close\n2024-05-01,1,2,0.5,1.5\n";
        let bars = parse_csv(body);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, 0.0);
    }
}

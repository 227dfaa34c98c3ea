use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::data::{MarketDataSource, TimeRange};
use crate::error::DataError;
use crate::events::Bar;
use crate::execution::retry::{is_retryable_http_status, CallKind, RetryPolicy};

#[derive(Debug, Deserialize)]
struct WireBar {
    ts: u64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

/// Historical bars over HTTP: `GET {base}/history/{symbol}?start=&end=`
/// returning a JSON array of `{ts, o, h, l, c, v}`.
pub struct RestHistorySource {
    client: Client,
    base: String,
    interval_ms: u64,
    retry: RetryPolicy,
}

impl RestHistorySource {
    pub fn new(base: &str, interval_ms: u64, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            interval_ms,
            retry,
        }
    }

    pub fn url(&self, symbol: &str, range: TimeRange) -> Result<Url, DataError> {
        let bad = |e: String| DataError::Source(format!("history url {}: {e}", self.base));
        let mut url = Url::parse(&self.base).map_err(|e| bad(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| bad("cannot be a base".into()))?
            .pop_if_empty()
            .push("history")
            .push(symbol);
        if range.start.is_some() || range.end.is_some() {
            let mut q = url.query_pairs_mut();
            if let Some(s) = range.start {
                q.append_pair("start", &s.to_string());
            }
            if let Some(e) = range.end {
                q.append_pair("end", &e.to_string());
            }
        }
        Ok(url)
    }

    async fn fetch_once(&self, symbol: &str, url: &str) -> Result<Vec<Bar>, DataError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DataError::Source(format!("GET {url}: {e}")))?;
        let status = resp.status().as_u16();
        if status == 404 {
            return Err(DataError::Empty { symbol: symbol.to_string() });
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            if is_retryable_http_status(status) {
                return Err(DataError::Source(format!("history {status}: {body}")));
            }
            return Err(DataError::Corrupt { line: 0, reason: format!("history {status}: {body}") });
        }
        let wire: Vec<WireBar> = resp
            .json()
            .await
            .map_err(|e| DataError::Corrupt { line: 0, reason: e.to_string() })?;
        Ok(wire
            .into_iter()
            .map(|w| Bar { ts: w.ts, interval_ms: self.interval_ms, o: w.o, h: w.h, l: w.l, c: w.c, v: w.v })
            .collect())
    }
}

#[async_trait]
impl MarketDataSource for RestHistorySource {
    fn name(&self) -> &str {
        "rest"
    }

    async fn bars(&self, symbol: &str, range: TimeRange) -> Result<Vec<Bar>, DataError> {
        let url = self.url(symbol, range)?;
        self.retry.run(CallKind::Read, "history", || self.fetch_once(symbol, url.as_str())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_range() {
        let src = RestHistorySource::new("http://localhost:8080/", 60_000, RetryPolicy::default());
        assert_eq!(src.url("BTC", TimeRange::default()).unwrap().as_str(), "http://localhost:8080/history/BTC");
        let r = TimeRange { start: Some(1), end: Some(2) };
        assert_eq!(src.url("BTC", r).unwrap().as_str(), "http://localhost:8080/history/BTC?start=1&end=2");
        assert_eq!(src.url("BTC/USD", r).unwrap().path(), "/history/BTC%2FUSD");
    }

    #[test]
    fn wire_bar_ignores_extra_fields() {
        let w: Vec<WireBar> =
            serde_json::from_str(r#"[{"ts":1,"o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":3.0,"interval_ms":60000}]"#).unwrap();
        assert_eq!(w[0].c, 1.5);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_source_error() {
        let policy = RetryPolicy { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 1, jitter_factor: 0.0 };
        let src = RestHistorySource::new("http://127.0.0.1:9", 60_000, policy);
        let err = src.bars("BTC", TimeRange::default()).await.unwrap_err();
        assert!(matches!(err, DataError::Source(_)));
    }
}

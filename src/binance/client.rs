// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are consumed: historical klines, the 24h
// ticker list, and ping. Every call carries a 10 s deadline and retries with
// exponential backoff. Response headers feed the shared rate-limit tracker
// so the degraded-mode polling path can budget its request weight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::market_data::kline::{parse_rest_kline, parse_wire_f64, Kline};
use crate::types::{Interval, Ticker};

/// Per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Total attempts per logical request (1 initial + 2 retries).
const MAX_ATTEMPTS: u32 = 3;
/// Backoff base; doubles per failed attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Binance REST client for public market data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limits: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(rate_limits: Arc<RateLimitTracker>) -> Self {
        Self::with_base_url("https://api.binance.com", rate_limits)
    }

    /// Point the client at a different host (test servers).
    pub fn with_base_url(base_url: impl Into<String>, rate_limits: Arc<RateLimitTracker>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            rate_limits,
        }
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    // -------------------------------------------------------------------------
    // Endpoints
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines — the most recent `limit` bars for one
    /// (symbol, interval), oldest first.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.get_with_retry(&url, 2).await?;

        let rows = body.as_array().context("klines response is not an array")?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut klines = Vec::with_capacity(rows.len());
        for row in rows {
            klines.push(parse_rest_kline(row, now_ms)?);
        }

        debug!(symbol, %interval, bars = klines.len(), "klines fetched");
        Ok(klines)
    }

    /// GET /api/v3/ticker/24hr — the full 24h ticker list.
    #[instrument(skip(self), name = "binance::get_24h_tickers")]
    pub async fn get_24h_tickers(&self) -> Result<Vec<Ticker>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let body = self.get_with_retry(&url, 80).await?;

        let rows = body.as_array().context("ticker response is not an array")?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut tickers = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_rest_ticker(row, now_ms) {
                Ok(ticker) => tickers.push(ticker),
                Err(e) => warn!(error = %e, "skipping malformed ticker row"),
            }
        }

        debug!(count = tickers.len(), "24h tickers fetched");
        Ok(tickers)
    }

    /// GET /api/v3/ping — connectivity health check.
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/v3/ping", self.base_url);
        self.get_with_retry(&url, 1).await.map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn get_with_retry(&self, url: &str, weight: u32) -> Result<serde_json::Value> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
            if !self.rate_limits.can_send_request(weight) {
                anyhow::bail!("request refused: rate-limit budget exhausted");
            }

            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(url, attempt, error = %e, "request attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("request failed with no attempts")))
    }

    async fn get_once(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}: {body}");
        }
        Ok(body)
    }
}

/// Parse one row of the 24h ticker response.
fn parse_rest_ticker(row: &serde_json::Value, now_ms: i64) -> Result<Ticker> {
    Ok(Ticker {
        symbol: row["symbol"]
            .as_str()
            .context("ticker missing symbol")?
            .to_string(),
        last_price: parse_wire_f64(&row["lastPrice"], "lastPrice")?,
        percent_change_24h: parse_wire_f64(&row["priceChangePercent"], "priceChangePercent")?,
        quote_volume_24h: parse_wire_f64(&row["quoteVolume"], "quoteVolume")?,
        event_time: row["closeTime"].as_i64().unwrap_or(now_ms),
    })
}

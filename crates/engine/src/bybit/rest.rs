use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use common::{Candle, Error, Interval, MarketDataClient, Result};

use super::kline::parse_price;
use super::rate_limit::RateLimiter;

const CATEGORY: &str = "linear";
const QUOTE_COIN: &str = "USDT";
const MAX_KLINE_LIMIT: usize = 1000;
const INSTRUMENT_PAGE_LIMIT: usize = 1000;

/// Public v5 market-data client. Used for backfill and the instrument list.
pub struct BybitClient {
    base_url: String,
    http: Client,
    limiter: RateLimiter,
}

impl BybitClient {
    pub fn new(base_url: impl Into<String>, limiter: RateLimiter) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            limiter,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.limiter.acquire().await;

        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body)?;
        envelope.into_result()
    }
}

#[async_trait]
impl MarketDataClient for BybitClient {
    async fn get_candles(&self, symbol: &str, interval: &Interval, limit: usize) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);
        debug!(%symbol, %interval, limit, "Fetching klines");

        let result: KlineResult = self
            .get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        parse_kline_rows(symbol, &result.list, interval.millis(), Utc::now().timestamp_millis())
    }

    async fn get_active_symbols(&self) -> Result<BTreeSet<String>> {
        let mut symbols = BTreeSet::new();
        let mut cursor = String::new();

        loop {
            let page: InstrumentsResult = self
                .get(
                    "/v5/market/instruments-info",
                    &[
                        ("category", CATEGORY.to_string()),
                        ("status", "Trading".to_string()),
                        ("limit", INSTRUMENT_PAGE_LIMIT.to_string()),
                        ("cursor", cursor.clone()),
                    ],
                )
                .await?;

            symbols.extend(
                page.list
                    .into_iter()
                    .filter(|i| i.quote_coin == QUOTE_COIN && i.status == "Trading")
                    .map(|i| i.symbol),
            );

            match page.next_page_cursor {
                Some(next) if !next.is_empty() && next != cursor => cursor = next,
                _ => break,
            }
        }

        info!(count = symbols.len(), "Fetched active instruments");
        Ok(symbols)
    }
}

/// Rows arrive newest first as `[start, open, high, low, close, volume, turnover]`.
/// Returns them oldest first without the candle still in progress at `now_ms`.
pub(crate) fn parse_kline_rows(
    symbol: &str,
    rows: &[Vec<String>],
    interval_ms: i64,
    now_ms: i64,
) -> Result<Vec<Candle>> {
    let mut candles = rows
        .iter()
        .map(|row| {
            if row.len() < 7 {
                return Err(Error::Exchange(format!("short kline row for {symbol}: {row:?}")));
            }
            let open_time = row[0]
                .parse::<i64>()
                .map_err(|_| Error::Exchange(format!("invalid start '{}'", row[0])))?;
            Ok(Candle {
                symbol: symbol.to_string(),
                open_time,
                open: parse_price("open", &row[1])?,
                high: parse_price("high", &row[2])?,
                low: parse_price("low", &row[3])?,
                close: parse_price("close", &row[4])?,
                volume: parse_price("volume", &row[5])?,
                turnover: parse_price("turnover", &row[6])?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    candles.reverse();
    candles.retain(|c| c.open_time + interval_ms <= now_ms);
    Ok(candles)
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

impl<T> Envelope<T> {
    fn into_result(self) -> Result<T> {
        if self.ret_code != 0 {
            return Err(Error::Exchange(format!("retCode {}: {}", self.ret_code, self.ret_msg)));
        }
        self.result
            .ok_or_else(|| Error::Exchange("response has no result".to_string()))
    }
}

#[derive(Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<Instrument>,
    next_page_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    symbol: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    quote_coin: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn row(start: i64, close: &str) -> Vec<String> {
        vec![
            start.to_string(),
            "100".into(),
            "110".into(),
            "90".into(),
            close.into(),
            "12.5".into(),
            "1250".into(),
        ]
    }

    #[test]
    fn rows_are_reversed_and_open_candle_dropped() {
        // Newest first; the candle at 3h is still open at 3.5h.
        let rows = vec![row(3 * HOUR, "104"), row(2 * HOUR, "103"), row(HOUR, "102")];
        let candles = parse_kline_rows("BTCUSDT", &rows, HOUR, 3 * HOUR + HOUR / 2).unwrap();

        let times: Vec<i64> = candles.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![HOUR, 2 * HOUR]);
        assert_eq!(candles[1].close, 103.0);
        assert_eq!(candles[0].symbol, "BTCUSDT");
    }

    #[test]
    fn candle_closing_exactly_now_is_kept() {
        let rows = vec![row(HOUR, "102")];
        let candles = parse_kline_rows("BTCUSDT", &rows, HOUR, 2 * HOUR).unwrap();
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn malformed_rows_are_errors() {
        let short = vec![vec!["1".to_string(), "2".to_string()]];
        assert!(parse_kline_rows("BTCUSDT", &short, HOUR, 0).is_err());
        let bad = vec![row(HOUR, "oops")];
        assert!(parse_kline_rows("BTCUSDT", &bad, HOUR, 10 * HOUR).is_err());
    }

    #[test]
    fn envelope_maps_ret_code() {
        let ok: Envelope<KlineResult> =
            serde_json::from_str(r#"{"retCode":0,"retMsg":"OK","result":{"list":[]}}"#).unwrap();
        assert!(ok.into_result().unwrap().list.is_empty());

        let err: Envelope<KlineResult> =
            serde_json::from_str(r#"{"retCode":10001,"retMsg":"params error","result":{}}"#).unwrap();
        match err.into_result() {
            Err(Error::Exchange(msg)) => assert!(msg.contains("params error")),
            other => panic!("expected exchange error, got {:?}", other.map(|r| r.list.len())),
        }
    }

    #[test]
    fn instruments_page_parses() {
        let page: Envelope<InstrumentsResult> = serde_json::from_str(
            r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[
                {"symbol":"BTCUSDT","status":"Trading","quoteCoin":"USDT"},
                {"symbol":"BTCPERP","status":"Trading","quoteCoin":"USDC"}
            ],"nextPageCursor":"abc"}}"#,
        )
        .unwrap();
        let page = page.into_result().unwrap();
        assert_eq!(page.list.len(), 2);
        assert_eq!(page.list[1].quote_coin, "USDC");
        assert_eq!(page.next_page_cursor.as_deref(), Some("abc"));
    }
}

//! Bybit v5 REST adapter.
//!
//! The only place in the engine where venue wire formats, float-ish string
//! fields and venue symbol spellings (`BTCUSDT`) exist. Conversion to
//! `Decimal` happens here, one-way; requests carry decimal quantities
//! rendered through their canonical string form.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::ExchangeSettings;
use crate::error::ExchangeError;
use crate::models::{
    spot_symbol_of, HistoricalFundingRate, InstrumentInfo, OhlcvCandle, OrderCategory,
    OrderRequest, OrderResult, OrderSide, OrderType,
};

use super::{AccountBalance, ExchangeClient, MarketEntry, TickerData};

const MAINNET_BASE: &str = "https://api.bybit.com";
const DEMO_BASE: &str = "https://api-demo.bybit.com";

/// How long a market order is polled for its fill before giving up.
const FILL_POLL_ATTEMPTS: u32 = 5;
const FILL_POLL_DELAY_MS: u64 = 200;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct BybitClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    recv_window: u64,
}

impl BybitClient {
    pub fn new(settings: &ExchangeSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http,
            base_url: if settings.demo { DEMO_BASE } else { MAINNET_BASE }.to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window: 5_000,
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Canonical -> venue spelling (`BTC/USDT:USDT` or `BTC/USDT` -> `BTCUSDT`).
    fn venue_symbol(symbol: &str) -> String {
        let pair = spot_symbol_of(symbol).unwrap_or(symbol);
        pair.replace('/', "")
    }

    /// Venue linear spelling -> canonical perp, USDT-settled pairs only.
    fn canonical_perp(venue: &str) -> Option<String> {
        let base = venue.strip_suffix("USDT")?;
        if base.is_empty() {
            return None;
        }
        Some(format!("{base}/USDT:USDT"))
    }

    fn canonical_spot(venue: &str) -> Option<String> {
        let base = venue.strip_suffix("USDT")?;
        if base.is_empty() {
            return None;
        }
        Some(format!("{base}/USDT"))
    }

    fn credentials(&self) -> Result<(&str, &str), ExchangeError> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(k), Some(s)) => Ok((k, s)),
            _ => Err(ExchangeError::Auth("api credentials not configured".into())),
        }
    }

    fn sign(&self, secret: &str, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Map an envelope retCode to the retry taxonomy.
    fn classify(ret_code: i64, ret_msg: &str) -> ExchangeError {
        match ret_code {
            10006 | 10018 => ExchangeError::RateLimit(format!("{ret_code}: {ret_msg}")),
            10003 | 10004 | 10005 | 33004 => ExchangeError::Auth(format!("{ret_code}: {ret_msg}")),
            10002 | 10016 => ExchangeError::Transient(format!("{ret_code}: {ret_msg}")),
            _ => ExchangeError::Permanent(format!("{ret_code}: {ret_msg}")),
        }
    }

    fn classify_http(status: reqwest::StatusCode, body: &str) -> ExchangeError {
        if status.as_u16() == 429 {
            ExchangeError::RateLimit(format!("http 429: {body}"))
        } else if status.is_server_error() {
            ExchangeError::Transient(format!("http {status}: {body}"))
        } else {
            ExchangeError::Permanent(format!("http {status}: {body}"))
        }
    }

    /// Unwrap the v5 response envelope, returning `result`.
    async fn envelope(resp: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_http(status, &body));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Permanent(format!("malformed envelope: {e}")))?;
        let ret_code = value["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let ret_msg = value["retMsg"].as_str().unwrap_or("").to_string();
            return Err(Self::classify(ret_code, &ret_msg));
        }
        Ok(value["result"].clone())
    }

    async fn get_public(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let resp = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("GET {path}: {e}")))?;
        Self::envelope(resp).await
    }

    async fn get_private(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let (key, secret) = self.credentials()?;
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let payload = format!("{ts}{key}{}{query_string}", self.recv_window);
        let signature = self.sign(secret, &payload);

        let resp = self
            .http
            .get(self.url(path))
            .query(query)
            .header("X-BAPI-API-KEY", key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("GET {path}: {e}")))?;
        Self::envelope(resp).await
    }

    async fn post_private(&self, path: &str, body: Value) -> Result<Value, ExchangeError> {
        let (key, secret) = self.credentials()?;
        let ts = chrono::Utc::now().timestamp_millis().to_string();
        let body_string = body.to_string();
        let payload = format!("{ts}{key}{}{body_string}", self.recv_window);
        let signature = self.sign(secret, &payload);

        let resp = self
            .http
            .post(self.url(path))
            .header("X-BAPI-API-KEY", key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("X-BAPI-SIGN", signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_string)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("POST {path}: {e}")))?;
        Self::envelope(resp).await
    }

    /// Poll the order endpoint until the market order reports its fill.
    async fn await_fill(
        &self,
        order_id: &str,
        venue_symbol: &str,
        category: OrderCategory,
    ) -> Result<(Decimal, Decimal, Decimal), ExchangeError> {
        for attempt in 0..FILL_POLL_ATTEMPTS {
            let result = self
                .get_private(
                    "/v5/order/realtime",
                    &[
                        ("category", category.as_str().to_string()),
                        ("symbol", venue_symbol.to_string()),
                        ("orderId", order_id.to_string()),
                    ],
                )
                .await?;

            if let Some(row) = result["list"].as_array().and_then(|l| l.first()) {
                let filled = dec_field(row, "cumExecQty");
                let avg = dec_field(row, "avgPrice");
                let fee = dec_field(row, "cumExecFee");
                if let (Some(filled), Some(avg)) = (filled, avg) {
                    if filled > Decimal::ZERO {
                        return Ok((filled, avg, fee.unwrap_or(Decimal::ZERO)));
                    }
                }
            }

            debug!(order_id, attempt, "order not filled yet, polling again");
            tokio::time::sleep(Duration::from_millis(FILL_POLL_DELAY_MS)).await;
        }

        Err(ExchangeError::Transient(format!(
            "order {order_id} reported no fill after {FILL_POLL_ATTEMPTS} polls"
        )))
    }

    fn instrument_from_row(row: &Value) -> InstrumentInfo {
        let lot = &row["lotSizeFilter"];
        let qty_step = dec_field(lot, "qtyStep")
            .or_else(|| dec_field(lot, "basePrecision"))
            .unwrap_or(Decimal::ONE);
        InstrumentInfo {
            min_qty: dec_field(lot, "minOrderQty").unwrap_or(Decimal::ZERO),
            qty_step,
            min_notional: dec_field(lot, "minOrderAmt")
                .or_else(|| dec_field(lot, "minNotionalValue"))
                .unwrap_or(Decimal::ZERO),
            tick_size: dec_field(&row["priceFilter"], "tickSize").unwrap_or(Decimal::ZERO),
        }
    }

    async fn fetch_markets_for(
        &self,
        category: OrderCategory,
    ) -> Result<Vec<MarketEntry>, ExchangeError> {
        let result = self
            .get_public(
                "/v5/market/instruments-info",
                &[
                    ("category", category.as_str().to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;

        let rows = result["list"].as_array().cloned().unwrap_or_default();
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let venue = row["symbol"].as_str().unwrap_or_default();
            let canonical = match category {
                OrderCategory::Spot => Self::canonical_spot(venue),
                OrderCategory::Linear => Self::canonical_perp(venue),
            };
            let Some(symbol) = canonical else {
                continue; // not USDT-quoted, out of scope
            };
            entries.push(MarketEntry {
                symbol,
                base: row["baseCoin"].as_str().unwrap_or_default().to_string(),
                quote: row["quoteCoin"].as_str().unwrap_or_default().to_string(),
                spot: category == OrderCategory::Spot,
                linear: category == OrderCategory::Linear,
                active: row["status"].as_str() == Some("Trading"),
                info: Self::instrument_from_row(row),
            });
        }
        Ok(entries)
    }

    fn interval_code(timeframe: &str) -> String {
        match timeframe {
            "1m" => "1",
            "5m" => "5",
            "15m" => "15",
            "30m" => "30",
            "1h" => "60",
            "4h" => "240",
            "1d" => "D",
            other => other,
        }
        .to_string()
    }
}

/// Parse a string-typed decimal field; empty strings are absent.
fn dec_field(row: &Value, key: &str) -> Option<Decimal> {
    let s = row[key].as_str()?;
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s).ok()
}

fn i64_field(row: &Value, key: &str) -> Option<i64> {
    match &row[key] {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn fetch_tickers(
        &self,
        category: OrderCategory,
    ) -> Result<Vec<TickerData>, ExchangeError> {
        let result = self
            .get_public(
                "/v5/market/tickers",
                &[("category", category.as_str().to_string())],
            )
            .await?;

        let rows = result["list"].as_array().cloned().unwrap_or_default();
        let mut tickers = Vec::with_capacity(rows.len());
        for row in &rows {
            let venue = row["symbol"].as_str().unwrap_or_default();
            let canonical = match category {
                OrderCategory::Spot => Self::canonical_spot(venue),
                OrderCategory::Linear => Self::canonical_perp(venue),
            };
            let Some(symbol) = canonical else { continue };

            tickers.push(TickerData {
                symbol,
                last: dec_field(row, "lastPrice"),
                funding_rate: dec_field(row, "fundingRate"),
                next_funding_time_ms: i64_field(row, "nextFundingTime"),
                funding_interval_hours: i64_field(row, "fundingIntervalHour")
                    .map(|h| h as u32),
                mark_price: dec_field(row, "markPrice"),
                index_price: dec_field(row, "indexPrice"),
                volume_24h: dec_field(row, "turnover24h").or_else(|| dec_field(row, "volume24h")),
            });
        }
        Ok(tickers)
    }

    async fn fetch_markets(&self) -> Result<Vec<MarketEntry>, ExchangeError> {
        let mut markets = self.fetch_markets_for(OrderCategory::Linear).await?;
        markets.extend(self.fetch_markets_for(OrderCategory::Spot).await?);
        Ok(markets)
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let result = self
            .get_private(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
            )
            .await?;

        let row = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .ok_or_else(|| ExchangeError::Permanent("empty balance list".into()))?;

        Ok(AccountBalance {
            total_equity: dec_field(&row, "totalEquity").unwrap_or(Decimal::ZERO),
            total_available: dec_field(&row, "totalAvailableBalance").unwrap_or(Decimal::ZERO),
            account_mm_rate: dec_field(&row, "accountMMRate").unwrap_or(Decimal::ZERO),
        })
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let venue = Self::venue_symbol(&req.symbol);
        let side = match req.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let order_type = match req.order_type {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        };

        // Decimal leaves the engine here, through its canonical string form.
        let mut body = json!({
            "category": req.category.as_str(),
            "symbol": venue,
            "side": side,
            "orderType": order_type,
            "qty": req.quantity.normalize().to_string(),
        });
        if let Some(price) = req.price {
            body["price"] = Value::String(price.normalize().to_string());
        }
        if req.category == OrderCategory::Spot {
            // Spot market orders size in base units, matching the perp leg.
            body["marketUnit"] = Value::String("baseCoin".to_string());
        }

        let result = self.post_private("/v5/order/create", body).await?;
        let order_id = result["orderId"]
            .as_str()
            .ok_or_else(|| ExchangeError::Permanent("order accepted without id".into()))?
            .to_string();

        let (filled_qty, filled_price, fee) =
            self.await_fill(&order_id, &venue, req.category).await?;

        Ok(OrderResult {
            order_id,
            symbol: req.symbol.clone(),
            side: req.side,
            filled_qty,
            filled_price,
            fee,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            is_simulated: false,
        })
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        category: OrderCategory,
    ) -> Result<bool, ExchangeError> {
        let body = json!({
            "category": category.as_str(),
            "symbol": Self::venue_symbol(symbol),
            "orderId": order_id,
        });
        match self.post_private("/v5/order/cancel", body).await {
            Ok(_) => Ok(true),
            Err(ExchangeError::Permanent(msg)) => {
                // Already filled/cancelled is a benign race for best-effort rollback.
                warn!(order_id, %msg, "cancel rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_funding_rate_history(
        &self,
        symbol: &str,
        limit: u32,
        end_ms: Option<i64>,
    ) -> Result<Vec<HistoricalFundingRate>, ExchangeError> {
        let end = end_ms.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let result = self
            .get_public(
                "/v5/market/funding/history",
                &[
                    ("category", "linear".to_string()),
                    ("symbol", Self::venue_symbol(symbol)),
                    ("limit", limit.to_string()),
                    // endTime always present: the venue rejects start-only queries.
                    ("endTime", end.to_string()),
                ],
            )
            .await?;

        let rows = result["list"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let (Some(rate), Some(ts)) = (
                dec_field(row, "fundingRate"),
                i64_field(row, "fundingRateTimestamp"),
            ) else {
                continue;
            };
            out.push(HistoricalFundingRate {
                symbol: symbol.to_string(),
                timestamp_ms: ts,
                rate,
                // The venue omits the interval in history rows; the fetcher
                // overlays the live interval before persisting.
                interval_hours: 8,
            });
        }
        Ok(out)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        end_ms: Option<i64>,
    ) -> Result<Vec<OhlcvCandle>, ExchangeError> {
        let end = end_ms.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let category = if crate::models::is_perp_symbol(symbol) {
            OrderCategory::Linear
        } else {
            OrderCategory::Spot
        };
        let result = self
            .get_public(
                "/v5/market/kline",
                &[
                    ("category", category.as_str().to_string()),
                    ("symbol", Self::venue_symbol(symbol)),
                    ("interval", Self::interval_code(timeframe)),
                    ("limit", limit.to_string()),
                    ("end", end.to_string()),
                ],
            )
            .await?;

        let rows = result["list"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(cols) = row.as_array() else { continue };
            if cols.len() < 6 {
                continue;
            }
            let parse = |i: usize| -> Option<Decimal> {
                cols.get(i)?.as_str().and_then(|s| Decimal::from_str(s).ok())
            };
            let Some(ts) = cols.first().and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
            else {
                continue;
            };
            let (Some(open), Some(high), Some(low), Some(close), Some(volume)) =
                (parse(1), parse(2), parse(3), parse(4), parse(5))
            else {
                continue;
            };
            out.push(OhlcvCandle {
                symbol: symbol.to_string(),
                timestamp_ms: ts,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbol_strips_delimiters() {
        assert_eq!(BybitClient::venue_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(BybitClient::venue_symbol("BTC/USDT"), "BTCUSDT");
    }

    #[test]
    fn canonical_mapping_is_usdt_only() {
        assert_eq!(
            BybitClient::canonical_perp("BTCUSDT").as_deref(),
            Some("BTC/USDT:USDT")
        );
        assert_eq!(BybitClient::canonical_perp("BTCUSDC"), None);
        assert_eq!(
            BybitClient::canonical_spot("SOLUSDT").as_deref(),
            Some("SOL/USDT")
        );
    }

    #[test]
    fn ret_code_classification() {
        assert!(matches!(
            BybitClient::classify(10006, "too many visits"),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            BybitClient::classify(10003, "invalid api key"),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            BybitClient::classify(10002, "request expired"),
            ExchangeError::Transient(_)
        ));
        assert!(matches!(
            BybitClient::classify(110001, "order not found"),
            ExchangeError::Permanent(_)
        ));
    }

    #[test]
    fn decimal_fields_parse_from_strings() {
        let row = json!({"price": "42000.5", "empty": "", "missing": null});
        assert_eq!(dec_field(&row, "price"), Some(Decimal::from_str("42000.5").unwrap()));
        assert_eq!(dec_field(&row, "empty"), None);
        assert_eq!(dec_field(&row, "missing"), None);
    }
}

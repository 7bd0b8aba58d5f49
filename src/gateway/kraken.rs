// Kraken REST gateway
//
// Public market data plus signed private order endpoints. All requests pass
// through one shared rate limiter; Kraken's envelope errors are classified
// into the engine taxonomy (rejections vs transient venue failures).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use tokio::sync::RwLock;

use crate::error::{BotError, Result};
use crate::gateway::{ExchangeGateway, TopOfBook};
use crate::models::{
    Bar, CancelOutcome, MarketConstraints, OrderAck, OrderIntent, OrderSnapshot, OrderStatus,
    OrderType,
};

const KRAKEN_API_BASE: &str = "https://api.kraken.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;
// One request per second keeps well inside Kraken's public tier limits.
const RATE_LIMIT_RPS: NonZeroU32 = NonZeroU32::MIN;

// Direct (unkeyed) limiter shared by all clones of the gateway.
type KrakenRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Kraken venue gateway.
///
/// Cloneable; clones share the HTTP client, the rate limiter and the pair
/// key cache.
#[derive(Clone)]
pub struct KrakenGateway {
    client: Client,
    credentials: Option<Credentials>,
    rate_limiter: Arc<KrakenRateLimiter>,
    /// Maps "XBT/USD" style symbols to Kraken's internal pair keys.
    pair_keys: Arc<RwLock<HashMap<String, String>>>,
}

#[derive(Clone)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

// Kraken wraps every payload in {error: [...], result: ...}.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AssetPairInfo {
    wsname: Option<String>,
    lot_decimals: u32,
    pair_decimals: u32,
    ordermin: Option<String>,
    costmin: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerInfo {
    /// Last trade closed: [price, lot volume].
    c: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DepthInfo {
    asks: Vec<Vec<Value>>,
    bids: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    txid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CancelResult {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct OrderInfo {
    status: String,
    /// Average fill price; "0.00000" until the first execution.
    price: Option<String>,
}

/// Kraken reports the average price as a string and as zero before any
/// fill; both map to `None`.
fn parse_avg_price(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|p| p.parse::<f64>().ok()).filter(|p| *p > 0.0)
}

/// Classify a non-empty Kraken error list. Order-level refusals map to
/// `VenueRejected`; everything else is treated as a transient venue failure.
fn classify_errors(errors: &[String]) -> BotError {
    let joined = errors.join("; ");
    let rejected = errors
        .iter()
        .any(|e| e.starts_with("EOrder") || e.starts_with("EGeneral:Invalid arguments"));
    if rejected {
        BotError::VenueRejected(joined)
    } else {
        BotError::VenueUnavailable(joined)
    }
}

/// Kraken OHLC rows mix numbers and numeric strings.
fn value_to_f64(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BotError::VenueUnavailable(format!("bad number {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| BotError::VenueUnavailable(format!("bad numeric string '{s}'"))),
        other => Err(BotError::VenueUnavailable(format!(
            "unexpected value {other}"
        ))),
    }
}

fn parse_ohlc_rows(rows: &[Value]) -> Result<Vec<Bar>> {
    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let cols = row
            .as_array()
            .ok_or_else(|| BotError::VenueUnavailable("OHLC row is not an array".to_string()))?;
        if cols.len() < 7 {
            return Err(BotError::VenueUnavailable("short OHLC row".to_string()));
        }
        let ts = value_to_f64(&cols[0])? as i64;
        let timestamp: DateTime<Utc> = DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| BotError::VenueUnavailable(format!("bad OHLC timestamp {ts}")))?;
        bars.push(Bar {
            timestamp,
            open: value_to_f64(&cols[1])?,
            high: value_to_f64(&cols[2])?,
            low: value_to_f64(&cols[3])?,
            close: value_to_f64(&cols[4])?,
            volume: value_to_f64(&cols[6])?,
        });
    }
    Ok(bars)
}

impl KrakenGateway {
    pub fn new(api_key: Option<String>, api_secret: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let quota = Quota::per_second(RATE_LIMIT_RPS);
        let credentials = match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) => Some(Credentials {
                api_key,
                api_secret,
            }),
            _ => None,
        };

        Ok(Self {
            client,
            credentials,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            pair_keys: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{KRAKEN_API_BASE}{path}");
        let response = self.client.get(&url).query(params).send().await?;
        if !response.status().is_success() {
            return Err(BotError::VenueUnavailable(format!(
                "GET {path} -> HTTP {}",
                response.status()
            )));
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.error.is_empty() {
            return Err(classify_errors(&envelope.error));
        }
        envelope
            .result
            .ok_or_else(|| BotError::VenueUnavailable(format!("GET {path}: empty result")))
    }

    async fn post_private<T: DeserializeOwned>(
        &self,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<T> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            BotError::VenueUnavailable("API credentials not configured".to_string())
        })?;

        self.rate_limiter.until_ready().await;

        let nonce = Utc::now().timestamp_millis().to_string();
        params.insert(0, ("nonce".to_string(), nonce.clone()));
        let postdata = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let signature = sign_request(path, &nonce, &postdata, &creds.api_secret)?;

        let url = format!("{KRAKEN_API_BASE}{path}");
        let response = self
            .client
            .post(&url)
            .header("API-Key", &creds.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::VenueUnavailable(format!(
                "POST {path} -> HTTP {}",
                response.status()
            )));
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.error.is_empty() {
            return Err(classify_errors(&envelope.error));
        }
        envelope
            .result
            .ok_or_else(|| BotError::VenueUnavailable(format!("POST {path}: empty result")))
    }

    /// Venue pair key for a "BASE/QUOTE" symbol, loading markets on a cache
    /// miss.
    async fn pair_key(&self, symbol: &str) -> Result<String> {
        if let Some(key) = self.pair_keys.read().await.get(symbol) {
            return Ok(key.clone());
        }
        self.load_markets().await?;
        self.pair_keys
            .read()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| BotError::VenueUnavailable(format!("unknown pair '{symbol}'")))
    }
}

fn sign_request(path: &str, nonce: &str, postdata: &str, api_secret: &str) -> Result<String> {
    // API-Sign = HMAC-SHA512(path + SHA256(nonce + postdata)) keyed with the
    // base64-decoded secret.
    let secret = B64
        .decode(api_secret)
        .map_err(|_| BotError::Config("KRAKEN_API_SECRET is not valid base64".to_string()))?;

    let mut sha = Sha256::new();
    sha.update(nonce.as_bytes());
    sha.update(postdata.as_bytes());
    let digest = sha.finalize();

    let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
        .map_err(|_| BotError::Config("KRAKEN_API_SECRET has invalid length".to_string()))?;
    mac.update(path.as_bytes());
    mac.update(&digest);

    Ok(B64.encode(mac.finalize().into_bytes()))
}

/// Resolve a base asset ("XBT") to Kraken's balance key ("XXBT", "ZUSD", or
/// the plain name for newer listings).
fn balance_key<'a>(balances: &'a HashMap<String, String>, asset: &str) -> Option<&'a String> {
    balances
        .get(asset)
        .or_else(|| balances.get(&format!("X{asset}")))
        .or_else(|| balances.get(&format!("Z{asset}")))
}

#[async_trait]
impl ExchangeGateway for KrakenGateway {
    async fn load_markets(&self) -> Result<HashMap<String, MarketConstraints>> {
        let pairs: HashMap<String, AssetPairInfo> =
            self.get_public("/0/public/AssetPairs", &[]).await?;

        let mut markets = HashMap::new();
        let mut keys = HashMap::new();
        for (pair_key, info) in pairs {
            let Some(symbol) = info.wsname else { continue };
            if let Some(status) = &info.status {
                if status != "online" {
                    continue;
                }
            }
            let constraints = MarketConstraints {
                min_amount: info
                    .ordermin
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0),
                min_notional: info
                    .costmin
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0),
                amount_precision: info.lot_decimals,
                price_precision: info.pair_decimals,
            };
            keys.insert(symbol.clone(), pair_key);
            markets.insert(symbol, constraints);
        }

        *self.pair_keys.write().await = keys;
        Ok(markets)
    }

    async fn fetch_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        let key = self.pair_key(symbol).await?;
        let interval = crate::config::parse_timeframe(timeframe)?;

        let mut result: HashMap<String, Value> = self
            .get_public(
                "/0/public/OHLC",
                &[
                    ("pair", key.clone()),
                    ("interval", interval.to_string()),
                ],
            )
            .await?;
        result.remove("last");

        let rows = result
            .into_values()
            .next()
            .and_then(|v| v.as_array().cloned())
            .ok_or_else(|| {
                BotError::VenueUnavailable(format!("no OHLC data for {symbol}"))
            })?;

        let mut bars = parse_ohlc_rows(&rows)?;
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64> {
        let key = self.pair_key(symbol).await?;
        let result: HashMap<String, TickerInfo> = self
            .get_public("/0/public/Ticker", &[("pair", key)])
            .await?;

        let ticker = result
            .into_values()
            .next()
            .ok_or_else(|| BotError::VenueUnavailable(format!("no ticker for {symbol}")))?;
        ticker
            .c
            .first()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| BotError::VenueUnavailable(format!("bad last price for {symbol}")))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<TopOfBook> {
        let key = self.pair_key(symbol).await?;
        let result: HashMap<String, DepthInfo> = self
            .get_public(
                "/0/public/Depth",
                &[("pair", key), ("count", depth.to_string())],
            )
            .await?;

        let book = result
            .into_values()
            .next()
            .ok_or_else(|| BotError::VenueUnavailable(format!("no order book for {symbol}")))?;
        let best_bid = book
            .bids
            .first()
            .and_then(|level| level.first())
            .map(value_to_f64)
            .transpose()?
            .ok_or_else(|| BotError::VenueUnavailable(format!("empty bids for {symbol}")))?;
        let best_ask = book
            .asks
            .first()
            .and_then(|level| level.first())
            .map(value_to_f64)
            .transpose()?
            .ok_or_else(|| BotError::VenueUnavailable(format!("empty asks for {symbol}")))?;

        Ok(TopOfBook { best_bid, best_ask })
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let key = self.pair_key(&intent.symbol).await?;

        let ordertype = match intent.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop-loss",
        };

        let mut params = vec![
            ("pair".to_string(), key),
            ("type".to_string(), intent.side.as_str().to_string()),
            ("ordertype".to_string(), ordertype.to_string()),
            ("volume".to_string(), intent.amount.to_string()),
        ];
        match intent.order_type {
            OrderType::Limit => {
                if let Some(price) = intent.price {
                    params.push(("price".to_string(), price.to_string()));
                }
            }
            OrderType::Stop => {
                // Kraken stop-loss orders carry the trigger in `price`.
                if let Some(trigger) = intent.trigger_price {
                    params.push(("price".to_string(), trigger.to_string()));
                }
            }
            OrderType::Market => {}
        }
        if intent.post_only {
            params.push(("oflags".to_string(), "post".to_string()));
        }
        if intent.reduce_only {
            params.push(("reduce_only".to_string(), "true".to_string()));
        }

        let result: AddOrderResult = self.post_private("/0/private/AddOrder", params).await?;
        let order_id = result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| BotError::VenueRejected("AddOrder returned no txid".to_string()))?;

        // Fill price arrives via polling; the ack only confirms acceptance.
        Ok(OrderAck {
            order_id,
            fill_price: None,
            status: OrderStatus::Pending,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<CancelOutcome> {
        let params = vec![("txid".to_string(), order_id.to_string())];
        match self
            .post_private::<CancelResult>("/0/private/CancelOrder", params)
            .await
        {
            Ok(result) if result.count > 0 => Ok(CancelOutcome::Canceled),
            Ok(_) => Ok(CancelOutcome::NotFound),
            Err(BotError::VenueRejected(msg)) if msg.contains("Unknown order") => {
                Ok(CancelOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_order_status(&self, order_id: &str, _symbol: &str) -> Result<OrderSnapshot> {
        let params = vec![("txid".to_string(), order_id.to_string())];
        let result: HashMap<String, OrderInfo> =
            self.post_private("/0/private/QueryOrders", params).await?;

        let info = result.get(order_id).ok_or_else(|| {
            BotError::VenueUnavailable(format!("order {order_id} not found"))
        })?;
        let status = match info.status.as_str() {
            "closed" => OrderStatus::Filled,
            "canceled" | "expired" => OrderStatus::Canceled,
            _ => OrderStatus::Pending,
        };
        Ok(OrderSnapshot {
            status,
            avg_fill_price: parse_avg_price(info.price.as_deref()),
        })
    }

    async fn fetch_free_balance(&self, asset: &str) -> Result<f64> {
        let balances: HashMap<String, String> =
            self.post_private("/0/private/Balance", Vec::new()).await?;

        Ok(balance_key(&balances, asset)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }
}

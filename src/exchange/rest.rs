//! Exchange REST client.
//!
//! Single façade for outbound REST calls, composing the rate limiter and the
//! retry handler (either can be bypassed via config), with:
//! - TTL response caching for GETs, keyed by endpoint + params
//! - correlation-id propagation on every request and error
//! - cooperative timeout, surfaced as a `Timeout` error distinct from
//!   application-level API errors
//! - HMAC signing for authenticated endpoints

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::{ExchangeConfig, RestConfig};
use crate::error::{EngineError, TracedError};
use crate::exchange::auth::sign_request;
use crate::logging::{correlation_id, LogBuffer, LogLevel};
use crate::services::{CircuitBreaker, Priority, RateLimiter, RetryHandler};
use crate::types::{DataSource, MarketData, OrderBook, OrderBookLevel, PriceField, WireLevel};

/// Result of a REST call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    /// Parsed JSON body.
    pub data: Value,
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// End-to-end duration (ms).
    pub duration_ms: u64,
    /// Whether this came from the response cache.
    pub cached: bool,
    /// Correlation id attached to the request.
    pub correlation_id: String,
}

/// A received response before it is stamped with timing/correlation.
#[derive(Clone)]
struct RawResponse {
    data: Value,
    status: u16,
    headers: Vec<(String, String)>,
}

/// TTL cache for idempotent GET responses.
struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

struct CacheEntry {
    response: RawResponse,
    expires_at: Instant,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<RawResponse> {
        let entry = self.entries.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.response.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    fn set(&self, key: String, response: RawResponse) {
        self.entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

#[derive(Clone)]
struct RequestSpec {
    method: Method,
    path: String,
    params: Vec<(String, String)>,
    body: Option<Value>,
    signed: bool,
    timeout: Duration,
    correlation_id: String,
}

/// Exchange REST client.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    exchange: Arc<ExchangeConfig>,
    config: RestConfig,
    limiter: Option<RateLimiter>,
    retry: Arc<RetryHandler>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    log: Arc<LogBuffer>,
}

impl RestClient {
    /// Create a client. Passing `None` for the limiter (or disabling it in
    /// config) sends requests straight through.
    pub fn new(
        exchange: ExchangeConfig,
        config: RestConfig,
        limiter: Option<RateLimiter>,
        retry: RetryHandler,
        breaker: CircuitBreaker,
        log: Arc<LogBuffer>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("riptide/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let cache = Arc::new(ResponseCache::new(Duration::from_millis(config.cache_ttl_ms)));

        Self {
            http,
            exchange: Arc::new(exchange),
            config,
            limiter,
            retry: Arc::new(retry),
            breaker: Arc::new(breaker),
            cache,
            log,
        }
    }

    /// Execute a REST request.
    ///
    /// GET responses are served from cache within the TTL. Errors carry the
    /// request's correlation id.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(String, String)>,
        body: Option<Value>,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse, TracedError> {
        self.request_inner(method, endpoint, params, body, false, priority, timeout)
            .await
    }

    /// Execute a signed REST request (authenticated endpoints).
    pub async fn signed_request(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(String, String)>,
        body: Option<Value>,
        priority: Priority,
    ) -> Result<ApiResponse, TracedError> {
        self.request_inner(method, endpoint, params, body, true, priority, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn request_inner(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(String, String)>,
        body: Option<Value>,
        signed: bool,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse, TracedError> {
        let correlation = correlation_id();
        let started = Instant::now();

        if signed && !self.exchange.has_credentials() {
            return Err(TracedError::new(
                EngineError::Authentication(
                    "API credentials are required for this endpoint".to_string(),
                ),
                correlation,
            ));
        }

        let cache_key = cache_key(&method, endpoint, &params);
        if method == Method::GET {
            if let Some(cached) = self.cache.get(&cache_key) {
                return Ok(ApiResponse {
                    data: cached.data,
                    status: cached.status,
                    headers: cached.headers,
                    duration_ms: started.elapsed().as_millis() as u64,
                    cached: true,
                    correlation_id: correlation,
                });
            }
        }

        let spec = RequestSpec {
            method: method.clone(),
            path: endpoint.to_string(),
            params,
            body,
            signed,
            timeout: timeout.unwrap_or(Duration::from_millis(self.config.timeout_ms)),
            correlation_id: correlation.clone(),
        };

        self.log.log(
            LogLevel::Debug,
            "rest",
            Some(&correlation),
            format!("{} {}", spec.method, spec.path),
        );

        let outcome = self.dispatch(spec, priority).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(raw) => {
                if method == Method::GET {
                    self.cache.set(cache_key, raw.clone());
                }
                self.log.log(
                    LogLevel::Debug,
                    "rest",
                    Some(&correlation),
                    format!("{} {} -> {} in {}ms", method, endpoint, raw.status, duration_ms),
                );
                Ok(ApiResponse {
                    data: raw.data,
                    status: raw.status,
                    headers: raw.headers,
                    duration_ms,
                    cached: false,
                    correlation_id: correlation,
                })
            }
            Err(err) => {
                let level = if err.is_critical() {
                    LogLevel::Error
                } else {
                    LogLevel::Warn
                };
                self.log.log(
                    level,
                    "rest",
                    Some(&correlation),
                    format!("{} {} failed: {}", method, endpoint, err),
                );
                Err(TracedError::new(err, correlation))
            }
        }
    }

    /// Route through limiter and retry handler per config.
    async fn dispatch(
        &self,
        spec: RequestSpec,
        priority: Priority,
    ) -> Result<RawResponse, EngineError> {
        let http = self.http.clone();
        let exchange = self.exchange.clone();
        let retry = self.retry.clone();
        let breaker = self.breaker.clone();
        let use_retry = self.config.use_retry;

        let attempt = move || {
            let http = http.clone();
            let exchange = exchange.clone();
            let retry = retry.clone();
            let breaker = breaker.clone();
            let spec = spec.clone();
            async move {
                if use_retry {
                    retry
                        .execute("rest", Some(&breaker), move || {
                            send_once(http.clone(), exchange.clone(), spec.clone())
                        })
                        .await
                } else {
                    send_once(http, exchange, spec).await
                }
            }
        };

        match (&self.limiter, self.config.use_rate_limiter) {
            (Some(limiter), true) => limiter.execute("rest", priority, attempt).await,
            _ => attempt().await,
        }
    }

    // -------------------------------------------------------------------------
    // Typed endpoints
    // -------------------------------------------------------------------------

    /// `GET /products` — tradable products.
    pub async fn get_products(&self) -> Result<Vec<Product>, TracedError> {
        let response = self
            .request(Method::GET, "/products", Vec::new(), None, Priority::Low, None)
            .await?;
        parse_result(response)
    }

    /// `GET /tickers[?symbols=]` — tickers for all or selected symbols.
    pub async fn get_tickers(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<Vec<TickerInfo>, TracedError> {
        let params = match symbols {
            Some(symbols) if !symbols.is_empty() => {
                vec![("symbols".to_string(), symbols.join(","))]
            }
            _ => Vec::new(),
        };
        let response = self
            .request(Method::GET, "/tickers", params, None, Priority::Normal, None)
            .await?;
        parse_result(response)
    }

    /// `GET /tickers/{symbol}` — a single ticker.
    pub async fn get_ticker(&self, symbol: &str) -> Result<TickerInfo, TracedError> {
        let response = self
            .request(
                Method::GET,
                &format!("/tickers/{}", symbol),
                Vec::new(),
                None,
                Priority::Normal,
                None,
            )
            .await?;
        parse_result(response)
    }

    /// `GET /l2orderbook/{symbol}?depth=` — order book snapshot.
    pub async fn get_orderbook(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Result<OrderBook, TracedError> {
        let response = self
            .request(
                Method::GET,
                &format!("/l2orderbook/{}", symbol),
                vec![("depth".to_string(), depth.to_string())],
                None,
                Priority::Normal,
                None,
            )
            .await?;
        let correlation = response.correlation_id.clone();
        let book: WireOrderBook = serde_json::from_value(result_value(response.data))
            .map_err(|e| TracedError::new(EngineError::Parse(e.to_string()), correlation))?;
        Ok(book.into_order_book(symbol))
    }

    /// `POST /orders` — place an order (authenticated).
    pub async fn place_order(&self, order: &OrderRequest) -> Result<Value, TracedError> {
        let body = serde_json::to_value(order)
            .map_err(|e| TracedError::new(EngineError::Parse(e.to_string()), correlation_id()))?;
        let response = self
            .signed_request(Method::POST, "/orders", Vec::new(), Some(body), Priority::High)
            .await?;
        Ok(result_value(response.data))
    }
}

/// Send a single HTTP request, mapping failures into the error taxonomy.
async fn send_once(
    http: reqwest::Client,
    exchange: Arc<ExchangeConfig>,
    spec: RequestSpec,
) -> Result<RawResponse, EngineError> {
    let url = format!("{}{}", exchange.rest_url.trim_end_matches('/'), spec.path);

    let mut request = http
        .request(spec.method.clone(), &url)
        .header("x-correlation-id", &spec.correlation_id);

    if !spec.params.is_empty() {
        request = request.query(&spec.params);
    }
    if let Some(body) = &spec.body {
        request = request.json(body);
    }
    if spec.signed {
        let api_key = exchange.api_key.clone().unwrap_or_default();
        let secret = exchange.api_secret.clone().unwrap_or_default();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign_request(&secret, spec.method.as_str(), &timestamp, &spec.path);
        request = request
            .header("api-key", api_key)
            .header("timestamp", timestamp)
            .header("signature", signature);
    }

    let timeout_ms = spec.timeout.as_millis() as u64;
    let response = tokio::time::timeout(spec.timeout, request.send())
        .await
        .map_err(|_| EngineError::Timeout(timeout_ms))??;

    let status = response.status();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let retry_after = headers
        .iter()
        .find(|(name, _)| name == "retry-after")
        .and_then(|(_, v)| v.parse::<u64>().ok())
        .map(|secs| secs * 1000);

    let text = tokio::time::timeout(spec.timeout, response.text())
        .await
        .map_err(|_| EngineError::Timeout(timeout_ms))??;

    if status.is_success() {
        let data = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        return Ok(RawResponse {
            data,
            status: status.as_u16(),
            headers,
        });
    }

    let message: String = text.chars().take(200).collect();
    Err(match status.as_u16() {
        401 | 403 => EngineError::Authentication(message),
        429 => EngineError::RateLimited {
            retry_after_ms: retry_after,
        },
        code => EngineError::Api {
            status: code,
            message,
        },
    })
}

fn cache_key(method: &Method, endpoint: &str, params: &[(String, String)]) -> String {
    let mut key = format!("{} {}", method, endpoint);
    for (name, value) in params {
        key.push_str(&format!("&{}={}", name, value));
    }
    key
}

/// Unwrap the exchange's `{"success": true, "result": ...}` envelope.
fn result_value(data: Value) -> Value {
    match data {
        Value::Object(mut map) => map.remove("result").unwrap_or(Value::Object(map)),
        other => other,
    }
}

fn parse_result<T: serde::de::DeserializeOwned>(
    response: ApiResponse,
) -> Result<T, TracedError> {
    let correlation = response.correlation_id.clone();
    serde_json::from_value(result_value(response.data))
        .map_err(|e| TracedError::new(EngineError::Parse(e.to_string()), correlation))
}

/// A tradable product.
#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    pub id: i64,
    pub symbol: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contract_type: Option<String>,
}

/// Ticker as returned by the REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerInfo {
    pub symbol: String,
    pub close: Option<PriceField>,
    pub open: Option<PriceField>,
    pub high: Option<PriceField>,
    pub low: Option<PriceField>,
    pub volume: Option<PriceField>,
    pub mark_price: Option<PriceField>,
}

impl TickerInfo {
    /// Convert into a dashboard snapshot; `None` without a close price.
    pub fn to_market_data(&self) -> Option<MarketData> {
        let price = self.close.as_ref()?.as_f64()?;
        let field = |f: &Option<PriceField>, default: f64| {
            f.as_ref().and_then(|v| v.as_f64()).unwrap_or(default)
        };
        Some(MarketData::new(
            self.symbol.clone(),
            price,
            field(&self.open, price),
            field(&self.high, price),
            field(&self.low, price),
            field(&self.volume, 0.0),
            self.mark_price.as_ref().and_then(|v| v.as_f64()),
            DataSource::Live,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct WireOrderBook {
    #[serde(default)]
    buy: Vec<WireLevel>,
    #[serde(default)]
    sell: Vec<WireLevel>,
}

impl WireOrderBook {
    fn into_order_book(self, symbol: &str) -> OrderBook {
        let convert = |levels: Vec<WireLevel>| {
            levels
                .into_iter()
                .filter_map(|l| {
                    Some(OrderBookLevel {
                        price: l.limit_price.as_f64()?,
                        size: l.size.as_f64()?,
                    })
                })
                .collect()
        };
        OrderBook {
            symbol: symbol.to_string(),
            bids: convert(self.buy),
            asks: convert(self.sell),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Order placement request.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub product_symbol: String,
    pub size: f64,
    pub side: String,
    pub order_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
}

impl OrderRequest {
    /// Market order.
    pub fn market(symbol: impl Into<String>, side: impl Into<String>, size: f64) -> Self {
        Self {
            product_symbol: symbol.into(),
            size,
            side: side.into(),
            order_type: "market_order".to_string(),
            limit_price: None,
        }
    }

    /// Limit order.
    pub fn limit(
        symbol: impl Into<String>,
        side: impl Into<String>,
        size: f64,
        price: f64,
    ) -> Self {
        Self {
            product_symbol: symbol.into(),
            size,
            side: side.into(),
            order_type: "limit_order".to_string(),
            limit_price: Some(price),
        }
    }
}
